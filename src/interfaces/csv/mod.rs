pub mod scenario_reader;
pub mod timeline_writer;
