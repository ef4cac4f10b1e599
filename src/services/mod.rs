pub mod file_repository;
pub mod object_storage;
pub mod relay_service;
