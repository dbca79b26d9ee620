//! Turns a table plus a query workload into a physical block layout
//! (spec.md §4.7-4.9): a horizontal recursive splitter, a hierarchical
//! column-group discovery and merge search built on top of it, and the
//! cost model both consult.

pub mod common;
pub mod hierarchical;
pub mod horizontal;
pub mod model;

pub use common::{aggregation_params, early_params, estimate_workload_cost, join_params};
pub use hierarchical::{column_blocks, hierarchical_partition, prune_unreachable_blocks, ColumnGroup};
pub use horizontal::horizontal_partition;
pub use model::{CostBreakdown, CostModel, ReconstructionTiming};
