pub mod ballot;
pub mod cleartext;
pub mod handle;
pub mod poll;
