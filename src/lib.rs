pub mod clock;
pub mod datom;
pub mod db;
pub mod entity;
pub mod schema;
pub mod storage;
pub mod tx;
