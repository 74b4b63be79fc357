pub mod catalog;
pub mod metric;
pub mod policy;

pub use catalog::{FilterSpec, ObjectTypeEntry, SloEntry};
pub use metric::MetricSample;
pub use policy::{
    DynamicPolicyRecord, ObjectSize, RecordError, ResolvedTarget, StaticPolicyEntry,
    StaticPolicyView,
};

pub mod prelude {
    pub use crate::catalog::{FilterSpec, ObjectTypeEntry, SloEntry};
    pub use crate::metric::MetricSample;
    pub use crate::policy::{
        DynamicPolicyRecord, ObjectSize, ResolvedTarget, StaticPolicyEntry, StaticPolicyView,
    };
}
