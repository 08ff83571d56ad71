pub mod collector;
pub mod launcher;
pub mod terminator;
pub mod worker;
