/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{collections::BTreeMap, fs, sync::atomic::AtomicBool};

use cap_std::{ambient_authority, fs::Dir};

use otaplan::{
    config::Config,
    format::{
        compression::CompressedFormat,
        oplist::{OpList, SuperLayout},
    },
    hooks::NoDeviceHooks,
    image::{BLOCK_SIZE, DataImage},
    ota::{self, PackageKind, PackageOptions},
    output::DirectoryOutput,
    plan::{
        block::{BlockDifference, DeviceRef},
        blockimgdiff::BlockImageDiffer,
        dynamic::{DynamicPartitionsDifference, DynamicPartitionsInfo, parse_info_dict},
    },
};

fn blocks(fills: &[u8]) -> Vec<u8> {
    fills
        .iter()
        .flat_map(|f| vec![*f; BLOCK_SIZE as usize])
        .collect()
}

#[test]
fn full_package_to_directory() {
    let config = Config {
        new_data_compression: CompressedFormat::None,
        ..Default::default()
    };
    let differ = BlockImageDiffer::new(&config);

    let target = DynamicPartitionsInfo::from_info_dict(&parse_info_dict(
        "super_partition_groups=main\n\
         super_main_group_size=65536\n\
         super_main_partition_list=system vendor\n\
         dynamic_partition_list=system vendor\n",
    ))
    .unwrap();

    let new = |name: &str, data| {
        BlockDifference::new(
            name,
            Box::new(DataImage::new(data)),
            None,
            DeviceRef::Dynamic(name.to_owned()),
            false,
            &differ,
            &config,
        )
        .unwrap()
    };
    let diffs = vec![new("system", blocks(&[1, 2, 0])), new("vendor", blocks(&[3]))];
    let progress = BTreeMap::from([("system".to_owned(), 0.8), ("vendor".to_owned(), 0.1)]);

    let dynamic = DynamicPartitionsDifference::new(&target, None, diffs, &progress, false).unwrap();

    let temp_dir = tempfile::tempdir().unwrap();
    let dir = Dir::open_ambient_dir(temp_dir.path(), ambient_authority()).unwrap();
    let mut output = DirectoryOutput::new(dir);

    ota::write_package(
        &config,
        PackageOptions {
            kind: PackageKind::Full,
            verify: true,
        },
        &NoDeviceHooks,
        &dynamic,
        &mut output,
        &AtomicBool::new(false),
    )
    .unwrap();

    for name in [
        "updater-script",
        "dynamic_partitions_op_list",
        "system.transfer.list",
        "system.new.dat",
        "system.patch.dat",
        "vendor.transfer.list",
        "vendor.new.dat",
        "vendor.patch.dat",
    ] {
        assert!(temp_dir.path().join(name).exists(), "Missing {name}");
    }

    assert_eq!(
        fs::read(temp_dir.path().join("system.new.dat")).unwrap(),
        blocks(&[1, 2])
    );

    let script = fs::read_to_string(temp_dir.path().join("updater-script")).unwrap();
    let update_metadata = script.find("update_dynamic_partitions").unwrap();
    let patch_system = script.find("block_image_update(map_partition(\"system\")").unwrap();
    assert!(update_metadata < patch_system);
    assert!(script.contains("show_progress(0.800000, 0);"));
    assert!(script.contains("unmap_partition(\"vendor\");"));

    // Applying the op list to any device layout yields the target layout.
    let op_list = fs::read_to_string(temp_dir.path().join("dynamic_partitions_op_list"))
        .unwrap()
        .parse::<OpList>()
        .unwrap();
    let mut layout = SuperLayout::default();
    layout.replay(&op_list).unwrap();

    assert_eq!(layout.groups["main"], 65536);
    assert_eq!(layout.partitions["system"].size, 3 * BLOCK_SIZE);
    assert_eq!(layout.partitions["vendor"].size, BLOCK_SIZE);
}
