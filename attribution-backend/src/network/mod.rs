//! HTTP delivery of attribution and debug reports.

pub mod bodies;
pub mod report_sender;

pub use report_sender::HttpReportSender;
