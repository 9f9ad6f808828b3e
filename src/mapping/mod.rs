//! Mapping tables and naming channels.

pub mod channel;
pub mod table;

pub use channel::{
    MappingResolver, MappingSource, NamingChannel, TemplateMappingSource, VersionData,
};
pub use table::MappingTable;
