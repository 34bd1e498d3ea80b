//! Memory mappings backing remotely flushed regions, and the primitives that
//! make stores in them durable.

mod devdax;
mod file;
mod flush;
mod mapping;

pub use devdax::is_devdax;
pub use flush::{CACHE_LINE, FlushMethod, detect_flush_method, drain, flush, flush_method, persist};
pub use mapping::{Mapping, MappingKind, map};
