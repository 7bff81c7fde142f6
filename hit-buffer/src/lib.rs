pub mod app_context;
pub mod buffer;
pub mod bulk;
pub mod config;
pub mod driver;
pub mod errors;
pub mod flush;
pub mod hit;
pub mod metrics_consts;
pub mod refspam;
pub mod session;
pub mod site;
