pub mod aggregate;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod notifier;
pub mod pages;
pub mod report;
