pub mod agent;
pub mod chat;
pub mod launch;
pub mod session;
