pub mod adapter;
pub mod height_view;

pub use adapter::{BlockId, Finality, RpcAdapter};
pub use height_view::HeightPinnedView;
