pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extract;
pub mod locale;
pub mod lock;
pub mod manager;
pub mod merge;
pub mod native;
pub mod process;
pub mod runtime;
pub mod scanner;
pub mod store;
pub mod sync;
pub mod tools;
pub mod transform;
