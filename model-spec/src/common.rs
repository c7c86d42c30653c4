pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools as _;
pub use noisy_float::prelude::*;
pub use serde::{
    de::{Error as _, SeqAccess, Visitor},
    ser::SerializeSeq as _,
    Deserialize, Deserializer, Serialize, Serializer,
};
pub use std::{
    fmt,
    fmt::{Debug, Display, Formatter},
    fs, iter, mem,
    path::{Path, PathBuf},
};
