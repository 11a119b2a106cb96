//! Mocked lower-layer collaborators for use in test

pub mod mock_acl_driver;
pub mod mock_connections;
pub mod mock_queue_end;
