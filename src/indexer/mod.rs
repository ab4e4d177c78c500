pub mod code_parser;
pub mod core;
pub mod javascript;
pub mod languages;
pub mod lineage;
pub mod php;
pub mod relations;
pub mod scan;
pub mod sql;
pub mod typescript;
