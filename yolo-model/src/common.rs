pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use derivative::Derivative;
pub use itertools::{izip, Itertools};
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use std::{
    borrow::Borrow,
    fmt,
    fmt::{Debug, Display, Formatter},
    iter, mem,
    time::Instant,
};
pub use strum::AsRefStr;
pub use tch::{
    nn::{self, ModuleT as _},
    Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
