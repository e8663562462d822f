//! The Status Ingest Endpoint: the one HTTP surface checker pods talk to.
//!
//! A `POST` carrying the `kh-run-uuid` header and a `{"OK": bool, "Errors":
//! [string]}` body is routed straight to the Runner that currently
//! authorizes that UUID; every other shape of request is rejected with 400
//! without ever touching the registry's write path.

use crate::runner::{IngestOutcome, IngestReport};
use crate::registry;
use error::*;
use kind::Kind;
use result::Result;
use response::Response;
use rocket::data::{Data, ToByteUnit};
use rocket::http::Status as HttpStatus;
use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};

pub const INGEST_PATH: &str = "/check";

struct RunUuidHeader(String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RunUuidHeader {
    type Error = Box<dyn AcmError>;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match req.headers().get_one("kh-run-uuid") {
            Some(value) if !value.is_empty() => Outcome::Success(RunUuidHeader(value.to_string())),
            _ => Outcome::Failure((HttpStatus::BadRequest, MissingRunUuidHeader {}.into())),
        }
    }
}

#[derive(Deserialize)]
struct WireBody {
    #[serde(rename = "OK")]
    ok: bool,
    #[serde(rename = "Errors", default)]
    errors: Vec<String>,
}

#[derive(Serialize, Kind)]
struct IngestAck {
    accepted: bool,
}

#[post("/check", data = "<body>")]
pub async fn check(uuid: RunUuidHeader, body: Data<'_>) -> Result<Response<IngestAck>> {
    let bytes = body
        .open(256.kibibytes())
        .into_bytes()
        .await
        .map_err(|_| MalformedIngestBody {})?;
    let wire: WireBody = serde_json::from_slice(&bytes).map_err(|_| MalformedIngestBody {})?;

    let report = IngestReport {
        ok: wire.ok,
        errors: wire.errors,
    };
    let outcome = registry::submit_report(&uuid.0, report).await?;
    match outcome {
        IngestOutcome::Accepted => Ok(IngestAck { accepted: true }.into()),
        IngestOutcome::UnknownOrStaleUuid => Err(StaleOrUnknownUuid { uuid: uuid.0 }.into()),
    }
}

#[derive(Error, AcmError, HttpCode, Kind, Debug)]
#[code(Status::BadRequest)]
#[error("the kh-run-uuid header was missing or empty")]
struct MissingRunUuidHeader {}

#[derive(Error, AcmError, HttpCode, Kind, Debug)]
#[code(Status::BadRequest)]
#[error("the request body could not be parsed as {{\"OK\": bool, \"Errors\": [string]}}")]
struct MalformedIngestBody {}

#[derive(Error, AcmError, HttpCode, Kind, Debug)]
#[code(Status::BadRequest)]
#[error("no check currently authorizes the run uuid {uuid}")]
struct StaleOrUnknownUuid {
    uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::local::blocking::Client;
    use rocket::http::Header;

    fn rocket() -> rocket::Rocket<rocket::Build> {
        rocket::build().mount("/", rocket::routes![check])
    }

    #[test]
    fn rejects_missing_uuid_header() {
        let client = Client::tracked(rocket()).expect("valid rocket instance");
        let response = client
            .post(INGEST_PATH)
            .body(r#"{"OK": true, "Errors": []}"#)
            .dispatch();
        assert_eq!(response.status(), HttpStatus::BadRequest);
    }

    #[test]
    fn rejects_malformed_body() {
        let client = Client::tracked(rocket()).expect("valid rocket instance");
        let response = client
            .post(INGEST_PATH)
            .header(Header::new("kh-run-uuid", "abc-123"))
            .body("not json")
            .dispatch();
        assert_eq!(response.status(), HttpStatus::BadRequest);
    }

    #[test]
    fn rejects_unknown_uuid() {
        let client = Client::tracked(rocket()).expect("valid rocket instance");
        let response = client
            .post(INGEST_PATH)
            .header(Header::new("kh-run-uuid", "no-such-run"))
            .body(r#"{"OK": true, "Errors": []}"#)
            .dispatch();
        assert_eq!(response.status(), HttpStatus::BadRequest);
    }
}
