//! Canned model descriptions.

use crate::{
    common::*,
    config::{Anchors, ArgValue, LayerSpec, ModelFile, ModuleKind, Source},
};

/// The P3/P4/P5 detection layout with compound scaling (0.33, 0.50).
pub fn yolo_v5_small(input_channels: usize, num_classes: usize) -> ModelFile {
    yolo_v5(input_channels, num_classes, r64(0.33), r64(0.50))
}

/// The same layout at full depth and width.
pub fn yolo_v5_large(input_channels: usize, num_classes: usize) -> ModelFile {
    yolo_v5(input_channels, num_classes, r64(1.0), r64(1.0))
}

fn yolo_v5(
    input_channels: usize,
    num_classes: usize,
    depth_multiple: R64,
    width_multiple: R64,
) -> ModelFile {
    ModelFile {
        num_classes,
        depth_multiple,
        width_multiple,
        input_channels,
        anchors: Anchors::PerScale(vec![
            anchor_row(&[10.0, 13.0, 16.0, 30.0, 33.0, 23.0]),
            anchor_row(&[30.0, 61.0, 62.0, 45.0, 59.0, 119.0]),
            anchor_row(&[116.0, 90.0, 156.0, 198.0, 373.0, 326.0]),
        ]),
        backbone: vec![
            conv(-1, &[64, 6, 2, 2]), // 0, P1/2
            conv(-1, &[128, 3, 2]),   // 1, P2/4
            c3(-1, 3, 128, true),
            conv(-1, &[256, 3, 2]), // 3, P3/8
            c3(-1, 6, 256, true),
            conv(-1, &[512, 3, 2]), // 5, P4/16
            c3(-1, 9, 512, true),
            conv(-1, &[1024, 3, 2]), // 7, P5/32
            c3(-1, 3, 1024, true),
            sppf(-1, 1024, 5), // 9
        ],
        head: vec![
            conv(-1, &[512, 1, 1]),
            upsample(-1, 2),
            concat(&[-1, 6]), // cat backbone P4
            c3(-1, 3, 512, false),
            conv(-1, &[256, 1, 1]), // 14
            upsample(-1, 2),
            concat(&[-1, 4]), // cat backbone P3
            c3(-1, 3, 256, false), // 17, P3/8 small
            conv(-1, &[256, 3, 2]),
            concat(&[-1, 14]), // cat head P4
            c3(-1, 3, 512, false), // 20, P4/16 medium
            conv(-1, &[512, 3, 2]),
            concat(&[-1, 10]), // cat head P5
            c3(-1, 3, 1024, false), // 23, P5/32 large
            detect(&[17, 20, 23]),
        ],
    }
}

fn anchor_row(sizes: &[f64]) -> Vec<R64> {
    sizes.iter().map(|&size| r64(size)).collect()
}

fn conv(from: isize, args: &[i64]) -> LayerSpec {
    LayerSpec {
        from: Source::Index(from),
        repeat: 1,
        kind: ModuleKind::Conv,
        args: args.iter().map(|&arg| ArgValue::Int(arg)).collect(),
    }
}

fn c3(from: isize, repeat: usize, out_c: i64, shortcut: bool) -> LayerSpec {
    let mut args = vec![ArgValue::Int(out_c)];
    if !shortcut {
        args.push(ArgValue::Bool(false));
    }
    LayerSpec {
        from: Source::Index(from),
        repeat,
        kind: ModuleKind::C3,
        args,
    }
}

fn sppf(from: isize, out_c: i64, k: i64) -> LayerSpec {
    LayerSpec {
        from: Source::Index(from),
        repeat: 1,
        kind: ModuleKind::Sppf,
        args: vec![ArgValue::Int(out_c), ArgValue::Int(k)],
    }
}

fn upsample(from: isize, scale: i64) -> LayerSpec {
    LayerSpec {
        from: Source::Index(from),
        repeat: 1,
        kind: ModuleKind::Upsample,
        args: vec![
            ArgValue::Null,
            ArgValue::Int(scale),
            ArgValue::Str("nearest".into()),
        ],
    }
}

fn concat(from: &[isize]) -> LayerSpec {
    LayerSpec {
        from: Source::Indices(from.to_vec()),
        repeat: 1,
        kind: ModuleKind::Concat,
        args: vec![ArgValue::Int(1)],
    }
}

fn detect(from: &[isize]) -> LayerSpec {
    LayerSpec {
        from: Source::Indices(from.to_vec()),
        repeat: 1,
        kind: ModuleKind::Detect,
        args: vec![],
    }
}
