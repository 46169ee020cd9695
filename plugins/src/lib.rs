pub mod completion;
pub mod factory;
pub mod safety;
pub mod services;
pub mod store;
