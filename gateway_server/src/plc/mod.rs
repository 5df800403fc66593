pub mod managed;
pub mod manager;
pub mod worker;
