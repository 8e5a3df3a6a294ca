pub mod barrier;
pub mod dispatch;
pub mod executor;
pub mod numa;
pub mod ops;
pub mod plan;
pub mod pool;
pub mod scratch;
pub mod tensor;
pub mod types;

pub use dispatch::{dispatch, CustomOpFn, CustomOpRegistry};
pub use executor::{compute, Context, Status};
pub use plan::{plan, AbortCallback, Plan};
pub use pool::{PoolParams, ThreadPool};
pub use tensor::{Graph, Op, Tensor};
pub use types::ElemType;
