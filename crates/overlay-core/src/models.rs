pub mod fragment;
pub mod geography;
pub mod metric;

pub use fragment::{Fragment, FragmentHash};
pub use geography::{ClipOp, ClippingLayer, DatasetFormat, Geography, GeographyId};
pub use metric::{
    MetricId, MetricRollup, MetricState, MetricSubject, MetricType, MetricValue, NewMetric,
    OverlayParams, RollupGranularity, SpatialMetric,
};
