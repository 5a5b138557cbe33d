// OS integration: raw virtual memory, per-page status queries, the
// process memory map, and thread suspension.

pub mod pagemap;
pub mod proc_maps;
pub mod suspend;
pub mod vm;
