//! Background tasks

pub mod cache_sweeper;
