pub mod stagein;
pub mod work;

pub use stagein::StageInWork;
pub use work::{
    CollectionRefresh, ContentDelta, InputOutputMaps, IoMap, NewInputOutputMaps, NewIoMap,
    PollUpdates, Work, WorkStatus, build_input_output_maps,
};
