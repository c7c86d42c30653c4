//! Declarative network description.
//!
//! A model document is a json5 file with a header (class count, compound
//! scaling multipliers, anchor table) and two layer lists, `backbone` and
//! `head`. Each layer is the 4-tuple `[from, repeat, kind, args]`.

use crate::common::*;

pub use arg_value_::*;
pub use kind_::*;
pub use layer_::*;
pub use model_file_::*;

mod model_file_ {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(try_from = "ModelFileUnchecked", into = "ModelFileUnchecked")]
    pub struct ModelFile {
        pub num_classes: usize,
        pub depth_multiple: R64,
        pub width_multiple: R64,
        pub input_channels: usize,
        pub anchors: Anchors,
        pub backbone: Vec<LayerSpec>,
        pub head: Vec<LayerSpec>,
    }

    impl ModelFile {
        pub fn load(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            let model: Self = json5::from_str(
                &fs::read_to_string(path)
                    .with_context(|| format!("cannot open '{}'", path.display()))?,
            )
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
            Ok(model)
        }

        /// Backbone and head layers in building order.
        pub fn layers(&self) -> impl Iterator<Item = &LayerSpec> {
            self.backbone.iter().chain(self.head.iter())
        }

        pub fn num_anchors(&self) -> usize {
            self.anchors.num_per_scale()
        }

        /// Per-position output width of the detection head, `na * (nc + 5)`.
        pub fn num_detection_outputs(&self) -> usize {
            self.num_anchors() * (self.num_classes + 5)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ModelFileUnchecked {
        num_classes: usize,
        depth_multiple: R64,
        width_multiple: R64,
        #[serde(default = "default_input_channels")]
        input_channels: usize,
        anchors: Anchors,
        backbone: Vec<LayerSpec>,
        head: Vec<LayerSpec>,
    }

    fn default_input_channels() -> usize {
        3
    }

    impl TryFrom<ModelFileUnchecked> for ModelFile {
        type Error = Error;

        fn try_from(from: ModelFileUnchecked) -> Result<Self> {
            let ModelFileUnchecked {
                num_classes,
                depth_multiple,
                width_multiple,
                input_channels,
                anchors,
                backbone,
                head,
            } = from;

            ensure!(num_classes >= 1, "num_classes must be positive");
            ensure!(input_channels >= 1, "input_channels must be positive");
            ensure!(
                depth_multiple.raw() > 0.0 && width_multiple.raw() > 0.0,
                "scaling multipliers must be positive"
            );
            ensure!(
                backbone.len() + head.len() >= 1,
                "the model defines no layers"
            );
            anchors.validate()?;

            Ok(Self {
                num_classes,
                depth_multiple,
                width_multiple,
                input_channels,
                anchors,
                backbone,
                head,
            })
        }
    }

    impl From<ModelFile> for ModelFileUnchecked {
        fn from(from: ModelFile) -> Self {
            let ModelFile {
                num_classes,
                depth_multiple,
                width_multiple,
                input_channels,
                anchors,
                backbone,
                head,
            } = from;

            Self {
                num_classes,
                depth_multiple,
                width_multiple,
                input_channels,
                anchors,
                backbone,
                head,
            }
        }
    }

    /// The anchor table, either explicit per-scale `[w, h, ...]` rows in
    /// pixel units, or a bare anchor count standing for priors that are
    /// learned or recomputed elsewhere.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum Anchors {
        Count(usize),
        PerScale(Vec<Vec<R64>>),
    }

    impl Anchors {
        pub fn validate(&self) -> Result<()> {
            match self {
                Self::Count(count) => {
                    ensure!(*count >= 1, "the anchor count must be positive");
                }
                Self::PerScale(rows) => {
                    ensure!(!rows.is_empty(), "the anchor table must not be empty");
                    rows.iter().try_for_each(|row| -> Result<_> {
                        ensure!(
                            !row.is_empty() && row.len() % 2 == 0,
                            "anchor rows are flat [w, h, ...] pair lists"
                        );
                        ensure!(
                            row.len() == rows[0].len(),
                            "anchor rows must declare the same number of pairs"
                        );
                        ensure!(
                            row.iter().all(|size| size.raw() > 0.0),
                            "anchor sizes must be positive"
                        );
                        Ok(())
                    })?;
                }
            }
            Ok(())
        }

        pub fn num_per_scale(&self) -> usize {
            match self {
                Self::Count(count) => *count,
                Self::PerScale(rows) => rows.first().map(|row| row.len() / 2).unwrap_or(0),
            }
        }

        /// Number of scale rows, when the table is explicit.
        pub fn num_scales(&self) -> Option<usize> {
            match self {
                Self::Count(_) => None,
                Self::PerScale(rows) => Some(rows.len()),
            }
        }

        /// (w, h) pairs per scale. A bare count expands to the synthetic
        /// index pairs (2k, 2k+1), replicated once per scale.
        pub fn to_pairs(&self, num_scales: usize) -> Vec<Vec<(R64, R64)>> {
            match self {
                Self::Count(count) => {
                    let row: Vec<_> = (0..*count)
                        .map(|k| (r64((2 * k) as f64), r64((2 * k + 1) as f64)))
                        .collect();
                    (0..num_scales).map(|_| row.clone()).collect()
                }
                Self::PerScale(rows) => rows
                    .iter()
                    .map(|row| row.iter().copied().tuples().collect())
                    .collect(),
            }
        }
    }

    impl Serialize for Anchors {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match self {
                Self::Count(count) => serializer.serialize_u64(*count as u64),
                Self::PerScale(rows) => rows.serialize(serializer),
            }
        }
    }

    impl<'de> Deserialize<'de> for Anchors {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct AnchorsVisitor;

            impl<'de> Visitor<'de> for AnchorsVisitor {
                type Value = Anchors;

                fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                    write!(f, "an anchor count or per-scale [w, h, ...] rows")
                }

                fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    let count =
                        usize::try_from(value).map_err(|_| E::custom("negative anchor count"))?;
                    Ok(Anchors::Count(count))
                }

                fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(Anchors::Count(value as usize))
                }

                fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    if value.fract() == 0.0 && value >= 0.0 {
                        Ok(Anchors::Count(value as usize))
                    } else {
                        Err(E::custom("the anchor count must be a non-negative integer"))
                    }
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: SeqAccess<'de>,
                {
                    let mut rows = vec![];
                    while let Some(row) = seq.next_element::<Vec<R64>>()? {
                        rows.push(row);
                    }
                    Ok(Anchors::PerScale(rows))
                }
            }

            deserializer.deserialize_any(AnchorsVisitor)
        }
    }
}

mod layer_ {
    use super::*;

    pub type RawLayerSpec = (Source, usize, ModuleKind, Vec<ArgValue>);

    /// One layer row: `[from, repeat, kind, args]`.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(try_from = "RawLayerSpec", into = "RawLayerSpec")]
    pub struct LayerSpec {
        pub from: Source,
        pub repeat: usize,
        pub kind: ModuleKind,
        pub args: Vec<ArgValue>,
    }

    impl TryFrom<RawLayerSpec> for LayerSpec {
        type Error = Error;

        fn try_from((from, repeat, kind, args): RawLayerSpec) -> Result<Self> {
            ensure!(repeat >= 1, "the repeat count must be positive");
            if let Source::Indices(list) = &from {
                ensure!(!list.is_empty(), "the source list must not be empty");
            }
            Ok(Self {
                from,
                repeat,
                kind,
                args,
            })
        }
    }

    impl From<LayerSpec> for RawLayerSpec {
        fn from(spec: LayerSpec) -> Self {
            (spec.from, spec.repeat, spec.kind, spec.args)
        }
    }

    /// Where a layer reads its input from. `-1` denotes the immediately
    /// preceding layer (the network input when at layer 0); other values
    /// are absolute layer indices, with negatives counting backwards.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum Source {
        Index(isize),
        Indices(Vec<isize>),
    }

    impl Source {
        pub fn single(&self) -> Option<isize> {
            match self {
                Self::Index(index) => Some(*index),
                Self::Indices(_) => None,
            }
        }

        pub fn indices(&self) -> Option<&[isize]> {
            match self {
                Self::Indices(indices) => Some(indices.as_slice()),
                Self::Index(_) => None,
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = isize> + '_ {
            let iter: Box<dyn Iterator<Item = isize>> = match self {
                Self::Index(index) => Box::new(iter::once(*index)),
                Self::Indices(indices) => Box::new(indices.iter().copied()),
            };
            iter
        }

        pub fn len(&self) -> usize {
            match self {
                Self::Index(_) => 1,
                Self::Indices(indices) => indices.len(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Display for Source {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                Self::Index(index) => write!(f, "{}", index),
                Self::Indices(indices) => {
                    write!(f, "[{}]", indices.iter().map(|ix| ix.to_string()).join(", "))
                }
            }
        }
    }

    impl Serialize for Source {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match self {
                Self::Index(index) => serializer.serialize_i64(*index as i64),
                Self::Indices(indices) => {
                    let mut seq = serializer.serialize_seq(Some(indices.len()))?;
                    indices
                        .iter()
                        .try_for_each(|index| seq.serialize_element(&(*index as i64)))?;
                    seq.end()
                }
            }
        }
    }

    impl<'de> Deserialize<'de> for Source {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct SourceVisitor;

            fn to_index<E>(value: f64) -> Result<isize, E>
            where
                E: serde::de::Error,
            {
                if value.is_finite() && value.fract() == 0.0 {
                    Ok(value as isize)
                } else {
                    Err(E::custom("layer references must be integers"))
                }
            }

            impl<'de> Visitor<'de> for SourceVisitor {
                type Value = Source;

                fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                    write!(f, "a layer reference or a list of layer references")
                }

                fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(Source::Index(value as isize))
                }

                fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    i64::try_from(value)
                        .map(|value| Source::Index(value as isize))
                        .map_err(|_| E::custom("layer reference out of range"))
                }

                fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(Source::Index(to_index(value)?))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: SeqAccess<'de>,
                {
                    let mut indices = vec![];
                    while let Some(index) = seq.next_element::<f64>()? {
                        indices.push(to_index(index)?);
                    }
                    Ok(Source::Indices(indices))
                }
            }

            deserializer.deserialize_any(SourceVisitor)
        }
    }
}

mod arg_value_ {
    use super::*;

    /// A per-kind layer argument. Integral floats are canonicalized to
    /// `Int` at the parsing boundary.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum ArgValue {
        Null,
        Bool(bool),
        Int(i64),
        Float(R64),
        Str(String),
        List(Vec<ArgValue>),
    }

    impl ArgValue {
        pub fn is_null(&self) -> bool {
            matches!(self, Self::Null)
        }

        pub fn as_usize(&self) -> Result<usize> {
            match self {
                Self::Int(value) => {
                    usize::try_from(*value).map_err(|_| format_err!("expected a non-negative integer, found {}", value))
                }
                _ => bail!("expected an integer, found {}", self),
            }
        }

        pub fn as_i64(&self) -> Result<i64> {
            match self {
                Self::Int(value) => Ok(*value),
                _ => bail!("expected an integer, found {}", self),
            }
        }

        pub fn as_bool(&self) -> Result<bool> {
            match self {
                Self::Bool(value) => Ok(*value),
                _ => bail!("expected a boolean, found {}", self),
            }
        }

        pub fn as_f64(&self) -> Result<f64> {
            match self {
                Self::Int(value) => Ok(*value as f64),
                Self::Float(value) => Ok(value.raw()),
                _ => bail!("expected a number, found {}", self),
            }
        }

        pub fn as_str(&self) -> Result<&str> {
            match self {
                Self::Str(value) => Ok(value),
                _ => bail!("expected a string, found {}", self),
            }
        }

        pub fn as_list(&self) -> Result<&[ArgValue]> {
            match self {
                Self::List(values) => Ok(values.as_slice()),
                _ => bail!("expected a list, found {}", self),
            }
        }
    }

    impl Display for ArgValue {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self {
                Self::Null => write!(f, "null"),
                Self::Bool(value) => write!(f, "{}", value),
                Self::Int(value) => write!(f, "{}", value),
                Self::Float(value) => write!(f, "{}", value),
                Self::Str(value) => write!(f, "'{}'", value),
                Self::List(values) => {
                    write!(f, "[{}]", values.iter().map(|arg| arg.to_string()).join(", "))
                }
            }
        }
    }

    impl Serialize for ArgValue {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match self {
                Self::Null => serializer.serialize_unit(),
                Self::Bool(value) => serializer.serialize_bool(*value),
                Self::Int(value) => serializer.serialize_i64(*value),
                Self::Float(value) => serializer.serialize_f64(value.raw()),
                Self::Str(value) => serializer.serialize_str(value),
                Self::List(values) => {
                    let mut seq = serializer.serialize_seq(Some(values.len()))?;
                    values
                        .iter()
                        .try_for_each(|value| seq.serialize_element(value))?;
                    seq.end()
                }
            }
        }
    }

    impl<'de> Deserialize<'de> for ArgValue {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ArgValueVisitor;

            impl<'de> Visitor<'de> for ArgValueVisitor {
                type Value = ArgValue;

                fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                    write!(f, "a scalar, string, null or list argument")
                }

                fn visit_unit<E>(self) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(ArgValue::Null)
                }

                fn visit_none<E>(self) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(ArgValue::Null)
                }

                fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(ArgValue::Bool(value))
                }

                fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(ArgValue::Int(value))
                }

                fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    i64::try_from(value)
                        .map(ArgValue::Int)
                        .map_err(|_| E::custom("integer argument out of range"))
                }

                fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    if !value.is_finite() {
                        return Err(E::custom("arguments must be finite numbers"));
                    }
                    const INTEGRAL_LIMIT: f64 = (1i64 << 53) as f64;
                    if value.fract() == 0.0 && value.abs() < INTEGRAL_LIMIT {
                        Ok(ArgValue::Int(value as i64))
                    } else {
                        Ok(ArgValue::Float(r64(value)))
                    }
                }

                fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
                where
                    E: serde::de::Error,
                {
                    Ok(ArgValue::Str(value.to_owned()))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: SeqAccess<'de>,
                {
                    let mut values = vec![];
                    while let Some(value) = seq.next_element::<ArgValue>()? {
                        values.push(value);
                    }
                    Ok(ArgValue::List(values))
                }
            }

            deserializer.deserialize_any(ArgValueVisitor)
        }
    }
}

mod kind_ {
    use super::*;

    /// The closed set of layer kinds. Unknown names fail at parse time;
    /// there is no dynamic lookup.
    #[derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        strum::Display,
        strum::EnumString,
    )]
    pub enum ModuleKind {
        Conv,
        Focus,
        Bottleneck,
        C3,
        Spp,
        Sppf,
        Reorg,
        Contract,
        Expand,
        ConvNextStage,
        Upsample,
        Concat,
        Sum,
        WeightedSum,
        Detect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_spec_round_trip() -> Result<()> {
        let text = r#"[-1, 1, "Conv", [64, 6, 2, 2]]"#;
        let spec: LayerSpec = json5::from_str(text)?;
        assert_eq!(spec.from, Source::Index(-1));
        assert_eq!(spec.repeat, 1);
        assert_eq!(spec.kind, ModuleKind::Conv);
        assert_eq!(
            spec.args,
            vec![
                ArgValue::Int(64),
                ArgValue::Int(6),
                ArgValue::Int(2),
                ArgValue::Int(2)
            ]
        );

        let text = serde_json::to_string(&spec)?;
        let reparsed: LayerSpec = serde_json::from_str(&text)?;
        assert_eq!(spec, reparsed);
        Ok(())
    }

    #[test]
    fn multi_source_and_null_args() -> Result<()> {
        let spec: LayerSpec = json5::from_str(r#"[[-1, 6], 1, "Concat", [1]]"#)?;
        assert_eq!(spec.from, Source::Indices(vec![-1, 6]));

        let spec: LayerSpec = json5::from_str(r#"[-1, 1, "Upsample", [null, 2, "nearest"]]"#)?;
        assert!(spec.args[0].is_null());
        assert_eq!(spec.args[1].as_usize()?, 2);
        assert_eq!(spec.args[2].as_str()?, "nearest");
        Ok(())
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result: Result<LayerSpec, _> = json5::from_str(r#"[-1, 1, "EvalMe", []]"#);
        assert!(result.is_err());
    }

    #[test]
    fn zero_repeat_is_rejected() {
        let result: Result<LayerSpec, _> = json5::from_str(r#"[-1, 0, "Conv", [64]]"#);
        assert!(result.is_err());
    }

    #[test]
    fn anchor_forms() -> Result<()> {
        let anchors: Anchors = json5::from_str("3")?;
        assert_eq!(anchors, Anchors::Count(3));
        assert_eq!(anchors.num_per_scale(), 3);
        let pairs = anchors.to_pairs(2);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0][1], (r64(2.0), r64(3.0)));

        let anchors: Anchors = json5::from_str("[[10, 13, 16, 30], [30, 61, 62, 45]]")?;
        anchors.validate()?;
        assert_eq!(anchors.num_per_scale(), 2);
        assert_eq!(anchors.num_scales(), Some(2));
        let pairs = anchors.to_pairs(2);
        assert_eq!(pairs[1][0], (r64(30.0), r64(61.0)));

        let anchors: Anchors = json5::from_str("[[10, 13, 16]]")?;
        assert!(anchors.validate().is_err());
        Ok(())
    }
}
