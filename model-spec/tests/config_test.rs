use anyhow::Result;
use model_spec::{config::ModelFile, graph::Graph, graph::NodeKey, zoo};
use std::path::{Path, PathBuf};

const MODEL_FILE_NAMES: &[&str] = &["yolov5-small.json5", "legacy-focus.json5"];

lazy_static::lazy_static! {
    static ref CONFIG_DIR: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("cfg");
    static ref MODEL_FILES: Vec<PathBuf> = {
        MODEL_FILE_NAMES.iter().map(|file_name| CONFIG_DIR.join(file_name)).collect()
    };
}

#[test]
fn documents_load_and_build() -> Result<()> {
    MODEL_FILES.iter().try_for_each(|path| -> Result<_> {
        let config = ModelFile::load(path)?;
        let _graph = Graph::new(&config)?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn document_matches_the_zoo_builder() -> Result<()> {
    let config = ModelFile::load(CONFIG_DIR.join("yolov5-small.json5"))?;
    assert_eq!(config, zoo::yolo_v5_small(3, 80));
    assert_eq!(Graph::new(&config)?, Graph::new(&zoo::yolo_v5_small(3, 80))?);
    Ok(())
}

#[test]
fn small_document_plan() -> Result<()> {
    let config = ModelFile::load(CONFIG_DIR.join("yolov5-small.json5"))?;
    let graph = Graph::new(&config)?;

    let save_indexes: Vec<_> = graph.save_keys().iter().map(|key| key.0).collect();
    assert_eq!(save_indexes, vec![4, 6, 10, 14, 17, 20, 23]);

    let channels: Vec<_> = graph
        .nodes()
        .values()
        .map(|node| node.output_channels)
        .collect();
    assert_eq!(
        channels,
        vec![
            32, 64, 64, 128, 128, 256, 256, 512, 512, 512, 256, 256, 512, 256, 128, 128, 256, 128,
            128, 256, 256, 256, 512, 512, 255
        ]
    );
    Ok(())
}

#[test]
fn legacy_document_plan() -> Result<()> {
    let config = ModelFile::load(CONFIG_DIR.join("legacy-focus.json5"))?;
    let graph = Graph::new(&config)?;

    assert_eq!(
        graph.save_keys(),
        &[4, 8, 10, 13].map(NodeKey).to_vec()
    );

    let channels: Vec<_> = graph
        .nodes()
        .values()
        .map(|node| node.output_channels)
        .collect();
    assert_eq!(
        channels,
        vec![32, 64, 64, 128, 128, 256, 256, 128, 128, 128, 128, 128, 512, 128, 256, 75]
    );

    let detect = graph.detect_spec().unwrap();
    assert_eq!(detect.num_classes, 20);
    assert_eq!(detect.in_channels, vec![256]);
    Ok(())
}

#[test]
fn repeated_builds_are_identical() -> Result<()> {
    let config = ModelFile::load(CONFIG_DIR.join("yolov5-small.json5"))?;
    assert_eq!(Graph::new(&config)?, Graph::new(&config)?);
    Ok(())
}

#[test]
fn forward_references_fail_to_build() {
    let config: ModelFile = json5::from_str(
        r#"{
            num_classes: 1,
            depth_multiple: 1.0,
            width_multiple: 1.0,
            anchors: 1,
            backbone: [
                [-1, 1, "Conv", [16, 3, 1]],
                [3, 1, "Conv", [16, 3, 1]],
            ],
            head: [[-1, 1, "Detect", []]],
        }"#,
    )
    .unwrap();
    let error = Graph::new(&config).unwrap_err();
    assert!(format!("{:#}", error).contains("forward reference"));
}
