//! Thin re-export of the `kube_runtime` watch primitives so that callers only
//! need to depend on this crate and not juggle `kube_runtime` directly.
pub use kube_runtime::watcher::{watcher, Error, Event};
