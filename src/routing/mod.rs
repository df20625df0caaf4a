mod matcher;
mod trie;

pub use matcher::{parse_query, CompiledRoute, RouteTable};
