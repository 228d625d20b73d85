pub mod agent;
pub mod routes;
pub mod script;
pub mod util;

pub use agent::agent;
pub use routes::routes;
pub use script::script;
