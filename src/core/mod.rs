// Core modules implementing buffer management, checkpoint encoding, and error modeling.
pub mod buffer;
pub mod entry;
pub mod epoch;
pub mod error;
pub mod manager;
pub mod mspace;
pub mod notify;
pub mod options;
pub mod reader;
pub mod relation;
pub mod serializer;
pub mod sink;
pub mod stats;
pub mod thread;
pub mod typeset;
pub mod writer;
