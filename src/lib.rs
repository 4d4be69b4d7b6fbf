pub mod compose;
pub mod compose_contracts;
pub mod core;
pub mod demo;
pub mod flow;
pub mod http;
pub mod impls;
pub mod registry;
pub mod schema;
pub mod streams;
pub mod tooling;

pub use compose::run_compose;
pub use compose_contracts::register_compose_contracts;
pub use core::register_core;
pub use flow::register_flow;
pub use http::register_http_contracts;
pub use impls::demo::register_demo_impls;
pub use registry::{CancelledError, Context, Registry};
pub use streams::StreamManager;
pub use tooling::{register_resolver_axioms, register_tooling};
