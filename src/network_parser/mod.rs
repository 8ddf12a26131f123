pub mod network;
pub mod page_service;
