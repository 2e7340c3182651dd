//! Saving and loading calibration datasets as HCD files.
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use icalibrate_config::HallCfg;
use icalibrate_config::hcd::{self, HcdFile};

use crate::conversions::dataset_from_hcd;
use crate::error::Result;
use crate::model::CalibrationDataset;
use crate::util::write_atomic;

/// Write `dataset` into `dir` under its standard file name and return the path.
pub fn save_dataset(dir: &Path, dataset: &CalibrationDataset) -> Result<PathBuf> {
    let path = dir.join(dataset.file_name());
    let text = hcd::render(&HcdFile::from(dataset));
    write_atomic(&path, text.as_bytes())
        .wrap_err_with(|| format!("write HCD file {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        detectors = dataset.datasets.len(),
        measurements = dataset.measurement_count(),
        "dataset saved"
    );
    Ok(path)
}

/// Read an HCD file, resolving chambers against `hall_cfg`.
pub fn load_dataset(path: &Path, hall_cfg: &HallCfg) -> Result<CalibrationDataset> {
    let file = hcd::read(path)?;
    dataset_from_hcd(&file, hall_cfg).wrap_err_with(|| format!("load {}", path.display()))
}
