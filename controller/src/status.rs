//! The Status/Metrics Surface: served by every replica, leader or not, from
//! whatever the local cache currently holds.

use crate::config::Config;
use crate::metrics;
use response::Response;
use result::Result;
use rocket::State;

#[get("/")]
pub async fn status_root() -> Result<Response<metrics::StatusSnapshot>> {
    Ok(metrics::status_snapshot().into())
}

#[get("/status")]
pub async fn status() -> Result<Response<metrics::StatusSnapshot>> {
    Ok(metrics::status_snapshot().into())
}

#[get("/metrics")]
pub async fn prometheus(config: &State<Config>) -> String {
    metrics::render_prometheus(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::Status as HttpStatus;
    use rocket::local::blocking::Client;

    fn rocket() -> rocket::Rocket<rocket::Build> {
        rocket::build()
            .manage(Config::from_env())
            .mount("/", rocket::routes![status_root, status, prometheus])
    }

    #[test]
    fn status_root_and_status_both_return_200() {
        let client = Client::tracked(rocket()).expect("valid rocket instance");
        assert_eq!(client.get("/").dispatch().status(), HttpStatus::Ok);
        assert_eq!(client.get("/status").dispatch().status(), HttpStatus::Ok);
    }

    #[test]
    fn metrics_route_exposes_cluster_state_gauge() {
        let client = Client::tracked(rocket()).expect("valid rocket instance");
        let response = client.get("/metrics").dispatch();
        assert_eq!(response.status(), HttpStatus::Ok);
        let body = response.into_string().expect("body");
        assert!(body.contains("kuberhealthy_cluster_state"));
    }
}
