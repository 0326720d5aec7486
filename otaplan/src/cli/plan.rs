// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use cap_std::{ambient_authority, fs::Dir};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use crate::{
    config::Config,
    format::{blockmap::BlockMap, fstab::Fstab, rangeset::RangeSet},
    hooks::DeviceHooks,
    image::{Image, SparseImage, SparseImageOptions},
    ota::{self, PackageKind, PackageOptions},
    output::DirectoryOutput,
    plan::{
        block::{BlockDifference, DeviceRef},
        blockimgdiff::BlockImageDiffer,
        dynamic::{self, DynamicPartitionsDifference, DynamicPartitionsInfo},
    },
    stream,
};

/// One side of a partition update.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageSpec {
    /// Sparse or raw image.
    image: PathBuf,
    /// Block map listing the blocks of every file in the image.
    block_map: Option<PathBuf>,
    /// Blocks rewritten unconditionally, in `0-9 12` form.
    #[serde(default)]
    clobbered_blocks: Option<String>,
    #[serde(default)]
    allow_shared_blocks: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartitionSpec {
    name: String,
    target: ImageSpec,
    source: Option<ImageSpec>,
    /// Fraction of the progress bar for this partition.
    progress: Option<f64>,
    /// Whether the partition lives in the super partition.
    #[serde(default = "default_true")]
    dynamic: bool,
    #[serde(default)]
    check_first_block: bool,
}

fn default_true() -> bool {
    true
}

/// Where the dynamic partition layout of a build comes from.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum LayoutSpec {
    InfoDict { info_dict: PathBuf },
    Inline(DynamicPartitionsInfo),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    target: LayoutSpec,
    /// Without a source layout, a full package is produced.
    source: Option<LayoutSpec>,
    /// Recovery fstab for resolving non-dynamic partitions.
    fstab: Option<PathBuf>,
    #[serde(default)]
    verify: bool,
    #[serde(default)]
    build_without_vendor: bool,
    #[serde(default)]
    partitions: Vec<PartitionSpec>,
}

fn read_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };

    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config TOML: {path:?}"))?;
    let config = Config::from_toml(&data)
        .with_context(|| format!("Failed to parse config TOML: {path:?}"))?;

    Ok(config)
}

fn read_plan(path: &Path) -> Result<PlanFile> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read plan TOML: {path:?}"))?;
    let plan = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse plan TOML: {path:?}"))?;

    Ok(plan)
}

fn load_layout(spec: &LayoutSpec, base_dir: &Path) -> Result<DynamicPartitionsInfo> {
    match spec {
        LayoutSpec::Inline(info) => Ok(info.clone()),
        LayoutSpec::InfoDict { info_dict } => {
            let path = base_dir.join(info_dict);
            let data = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read info dictionary: {path:?}"))?;
            let dict = dynamic::parse_info_dict(&data);

            DynamicPartitionsInfo::from_info_dict(&dict)
                .with_context(|| format!("Failed to parse info dictionary: {path:?}"))
        }
    }
}

fn open_image(spec: &ImageSpec, base_dir: &Path) -> Result<Box<dyn Image>> {
    let path = base_dir.join(&spec.image);

    let block_map = spec
        .block_map
        .as_ref()
        .map(|p| {
            let path = base_dir.join(p);
            let file = File::open(&path)
                .with_context(|| format!("Failed to open block map: {path:?}"))?;

            BlockMap::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse block map: {path:?}"))
        })
        .transpose()?;

    let clobbered_blocks = spec
        .clobbered_blocks
        .as_deref()
        .map(str::parse::<RangeSet>)
        .transpose()
        .with_context(|| format!("Invalid clobbered blocks for image: {path:?}"))?
        .unwrap_or_default();

    let file = File::open(&path).with_context(|| format!("Failed to open image: {path:?}"))?;
    let image = SparseImage::new(
        file,
        SparseImageOptions {
            block_map,
            clobbered_blocks,
            allow_shared_blocks: spec.allow_shared_blocks,
        },
    )
    .with_context(|| format!("Failed to load image: {path:?}"))?;

    Ok(Box::new(image))
}

/// Loads and diffs the images of a set of partitions.
struct PartitionLoader<'a> {
    config: &'a Config,
    base_dir: &'a Path,
    fstab: Option<&'a Fstab>,
    full: bool,
    cancel_signal: &'a AtomicBool,
}

impl PartitionLoader<'_> {
    fn load(&self, spec: &PartitionSpec) -> Result<BlockDifference> {
        stream::check_cancel(self.cancel_signal)?;

        let tgt = open_image(&spec.target, self.base_dir)?;
        let src = match &spec.source {
            Some(s) if !self.full => Some(open_image(s, self.base_dir)?),
            _ => None,
        };
        let device = DeviceRef::resolve(&spec.name, spec.dynamic, self.fstab)?;
        let differ = BlockImageDiffer::new(self.config);

        BlockDifference::new(
            spec.name.clone(),
            tgt,
            src,
            device,
            spec.check_first_block,
            &differ,
            self.config,
        )
        .with_context(|| format!("Failed to compute update for {}", spec.name))
    }
}

/// Supplies the partitions outside the super partition.
struct StaticPartitionHooks<'a> {
    loader: PartitionLoader<'a>,
    partitions: Vec<&'a PartitionSpec>,
}

impl StaticPartitionHooks<'_> {
    fn block_differences(&self) -> Result<Vec<BlockDifference>> {
        self.partitions
            .iter()
            .map(|p| self.loader.load(p))
            .collect()
    }
}

impl DeviceHooks for StaticPartitionHooks<'_> {
    fn full_ota_block_differences(&self, _config: &Config) -> Result<Vec<BlockDifference>> {
        self.block_differences()
    }

    fn incremental_ota_block_differences(
        &self,
        _config: &Config,
    ) -> Result<Vec<BlockDifference>> {
        self.block_differences()
    }
}

fn plan_subcommand(cli: &PlanCli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = read_config(cli.config.as_deref())?;
    let plan = read_plan(&cli.plan)?;
    let base_dir = cli.plan.parent().unwrap_or_else(|| Path::new("."));

    let target = load_layout(&plan.target, base_dir)?;
    let source = plan
        .source
        .as_ref()
        .map(|s| load_layout(s, base_dir))
        .transpose()?;
    let kind = if source.is_some() {
        PackageKind::Incremental
    } else {
        PackageKind::Full
    };

    let fstab = plan
        .fstab
        .as_ref()
        .map(|p| {
            let path = base_dir.join(p);
            let data = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read fstab: {path:?}"))?;

            Fstab::parse(&data).with_context(|| format!("Failed to parse fstab: {path:?}"))
        })
        .transpose()?;

    let mut names = plan.partitions.iter().map(|p| &p.name).collect::<Vec<_>>();
    names.sort();
    if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
        bail!("Partition listed more than once: {:?}", w[0]);
    }

    let loader = PartitionLoader {
        config: &config,
        base_dir,
        fstab: fstab.as_ref(),
        full: kind == PackageKind::Full,
        cancel_signal,
    };

    let (dynamic_specs, static_specs): (Vec<_>, Vec<_>) =
        plan.partitions.iter().partition(|p| p.dynamic);

    let block_diffs = dynamic_specs
        .iter()
        .map(|p| loader.load(p))
        .collect::<Result<Vec<_>>>()?;
    let progress = dynamic_specs
        .iter()
        .filter_map(|p| p.progress.map(|f| (p.name.clone(), f)))
        .collect::<BTreeMap<_, _>>();

    let dynamic = DynamicPartitionsDifference::new(
        &target,
        source.as_ref(),
        block_diffs,
        &progress,
        plan.build_without_vendor,
    )
    .context("Invalid dynamic partition layout")?;

    let hooks = StaticPartitionHooks {
        loader,
        partitions: static_specs,
    };

    fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create directory: {:?}", cli.output))?;
    let dir = Dir::open_ambient_dir(&cli.output, ambient_authority())
        .with_context(|| format!("Failed to open directory: {:?}", cli.output))?;
    let mut output = DirectoryOutput::new(dir);

    ota::write_package(
        &config,
        PackageOptions {
            kind,
            verify: plan.verify,
        },
        &hooks,
        &dynamic,
        &mut output,
        cancel_signal,
    )?;

    info!("Wrote package artifacts to {:?}", cli.output);

    Ok(())
}

pub fn plan_main(cli: &PlanCli, cancel_signal: &AtomicBool) -> Result<()> {
    plan_subcommand(cli, cancel_signal)
}

/// Compute a block-based update package.
///
/// The plan TOML lists the target and (for incremental packages) source
/// dynamic partition layouts and the images of every partition. Relative paths
/// in the plan are resolved against the plan's directory. The install script
/// and every artifact it references are written to the output directory.
#[derive(Debug, Parser)]
pub struct PlanCli {
    /// Path to config TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    config: Option<PathBuf>,

    /// Path to plan TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    plan: PathBuf,

    /// Path to output directory.
    #[arg(short, long, value_name = "DIR", value_parser)]
    output: PathBuf,
}
