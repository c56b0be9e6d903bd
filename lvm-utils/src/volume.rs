// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating, destroying and resizing logical volumes.

use crate::{execute, ExecutionError, LVCREATE, LVEXTEND, LVREMOVE, LVS, VGS, WIPEFS};
use camino::Utf8PathBuf;
use lvm_types::{LvmVolume, RaidType, VolumeInfo};

/// Root for `/dev/<vg>/<lv>` paths.
pub const DEV_PATH: &str = "/dev/";
/// Root for device-mapper paths.
pub const DEV_MAPPER_PATH: &str = "/dev/mapper/";

/// Suffix of the per-VG thin pool LV.
pub const THIN_POOL_SUFFIX: &str = "_thinpool";

/// Amount shaved off a volume group's free space when sizing a new thin
/// pool, so the pool lands on an extent boundary (256 MiB).
pub const MIN_EXTENT_ROUND_OFF_SIZE: u64 = 268435456;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("invalid capacity {value:?} for volume {volume}: {err}")]
    BadCapacity {
        volume: String,
        value: String,
        err: std::num::ParseIntError,
    },

    #[error("failed to stat device {path}: {err}")]
    Stat { path: Utf8PathBuf, err: std::io::Error },

    #[error("unexpected output from [{command}]: {output:?}")]
    Output { command: String, output: String },
}

/// Doubles the hyphens in one device-mapper name component. LVM separates
/// the volume group from the volume with a single hyphen, so hyphens
/// inside either name are escaped by doubling.
pub fn encode_mapper_component(name: &str) -> String {
    name.replace('-', "--")
}

/// Inverse of [`encode_mapper_component`].
pub fn decode_mapper_component(name: &str) -> String {
    name.replace("--", "-")
}

/// The `/dev/mapper/<vg>-<lv>` path of a volume, with the hyphen-doubling
/// rule applied to both components. This path doubles as the idempotence
/// probe for volume creation.
pub fn device_mapper_path(vg: &str, lv: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "{DEV_MAPPER_PATH}{}-{}",
        encode_mapper_component(vg),
        encode_mapper_component(lv)
    ))
}

/// The `/dev/<vg>/<lv>` path of a volume.
pub fn dev_path(vg: &str, lv: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{DEV_PATH}{vg}/{lv}"))
}

/// Name of the thin pool LV serving thin volumes in `vg`.
pub fn thin_pool_name(vg: &str) -> String {
    format!("{vg}{THIN_POOL_SUFFIX}")
}

/// Whether the device node for `vol` resolves on this host.
pub fn volume_exists(vol: &LvmVolume) -> Result<bool, Error> {
    let path = device_mapper_path(&vol.spec.vol_group, vol.name());
    match std::fs::metadata(&path) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::Stat { path, err }),
    }
}

/// Whether `vg/<name>` exists according to `lvs`. LVM exits non-zero for
/// an unknown LV, so command failure reads as absence.
pub fn lv_exists(vg: &str, name: &str) -> Result<bool, Error> {
    let mut command = std::process::Command::new(LVS);
    command.args([
        &format!("{vg}/{name}"),
        "--noheadings",
        "-o",
        "lv_name",
    ]);
    match execute(&mut command) {
        Ok(output) => {
            let reported = String::from_utf8_lossy(&output.stdout);
            Ok(reported.trim() == name)
        }
        Err(ExecutionError::CommandFailure(_)) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Free bytes in `vg`, via `vgs -o vg_free`.
pub fn vg_free_bytes(vg: &str) -> Result<u64, Error> {
    let mut command = std::process::Command::new(VGS);
    command.args([
        vg,
        "--noheadings",
        "-o",
        "vg_free",
        "--units",
        "b",
        "--nosuffix",
    ]);
    let output = execute(&mut command)?;
    let raw = String::from_utf8_lossy(&output.stdout);
    raw.trim().parse::<u64>().map_err(|_| Error::Output {
        command: format!("{VGS} {vg} -o vg_free"),
        output: raw.trim().to_string(),
    })
}

/// Size for a thin pool about to be created in a volume group with
/// `vg_free` bytes available: the requested capacity, capped at the free
/// space less the 256 MiB extent round-off shave.
pub fn thin_pool_size(vg_free: u64, requested: u64) -> u64 {
    requested.min(vg_free.saturating_sub(MIN_EXTENT_ROUND_OFF_SIZE))
}

fn capacity_bytes(vol: &LvmVolume) -> Result<u64, Error> {
    vol.spec.capacity_bytes().map_err(|err| Error::BadCapacity {
        volume: vol.name().to_string(),
        value: vol.spec.capacity.clone(),
        err,
    })
}

fn push_raid_args(args: &mut Vec<String>, spec: &VolumeInfo) {
    let raid = &spec.raid;
    if raid.raid_type != RaidType::Linear {
        args.push("--type".to_string());
        args.push(raid.raid_type.to_string());
    }
    if raid.mirrors > 0 {
        args.push("--mirrors".to_string());
        args.push(raid.mirrors.to_string());
    }
    if raid.no_sync.is_yes() {
        args.push("--nosync".to_string());
    }
    if raid.stripe_count > 0 {
        args.push("--stripes".to_string());
        args.push(raid.stripe_count.to_string());
    }
    if raid.stripe_size > 0 {
        args.push("--stripesize".to_string());
        args.push(raid.stripe_size.to_string());
    }
    if raid.integrity.is_yes() {
        args.push("--raidintegrity".to_string());
        args.push("y".to_string());
    }
}

/// Assembles the `lvcreate` argument list for `vol`.
///
/// For thin volumes, `new_pool_size` carries the size of the thin pool to
/// create alongside (`None` when the pool already exists and the volume
/// just borrows from it). A single invocation creates pool and volume:
/// `lvcreate -L <pool> -T <vg>/<vg>_thinpool -V <size>b -n <name>`.
/// The trailing `-y` wipes old signatures found on the reused extents.
pub fn lvcreate_args(
    vol: &LvmVolume,
    new_pool_size: Option<u64>,
) -> Vec<String> {
    let spec = &vol.spec;
    let thin = spec.thin_provision.is_yes();
    let size = format!("{}b", spec.capacity);
    let mut args = Vec::new();

    if !spec.capacity.is_empty() {
        if !thin {
            args.push("-L".to_string());
            args.push(size.clone());
        } else if let Some(pool_size) = new_pool_size {
            args.push("-L".to_string());
            args.push(format!("{pool_size}b"));
        }
    }

    if !thin {
        // Thin volumes take their layout from the pool.
        push_raid_args(&mut args, spec);
    }

    if thin {
        args.push("-T".to_string());
        args.push(format!(
            "{}/{}",
            spec.vol_group,
            thin_pool_name(&spec.vol_group)
        ));
        args.push("-V".to_string());
        args.push(size);
    }

    if !spec.vol_group.is_empty() {
        args.push("-n".to_string());
        args.push(vol.name().to_string());
    }

    if !thin {
        args.push(spec.vol_group.clone());
    }

    if let Some(options) = &spec.raid.lv_create_options {
        args.extend(
            options
                .split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from),
        );
    }

    args.push("-y".to_string());
    args
}

/// Assembles the `lvremove` argument list for `vol`.
pub fn lvremove_args(vol: &LvmVolume) -> Vec<String> {
    vec![
        "-y".to_string(),
        dev_path(&vol.spec.vol_group, vol.name()).to_string(),
    ]
}

/// Assembles the `lvextend` argument list for `vol`; `-r` grows the
/// filesystem along with the LV.
pub fn lvextend_args(vol: &LvmVolume, resize_fs: bool) -> Vec<String> {
    let mut args = vec![
        dev_path(&vol.spec.vol_group, vol.name()).to_string(),
        "-L".to_string(),
        format!("{}b", vol.spec.capacity),
    ];
    if resize_fs {
        args.push("-r".to_string());
    }
    args
}

/// Creates the logical volume for `vol`, including the volume group's thin
/// pool when a thin volume is requested and no pool exists yet. A volume
/// whose device node already resolves is left untouched.
pub fn create_volume(vol: &LvmVolume) -> Result<(), Error> {
    if volume_exists(vol)? {
        return Ok(());
    }

    let mut new_pool_size = None;
    if vol.spec.thin_provision.is_yes() {
        let pool = thin_pool_name(&vol.spec.vol_group);
        if !lv_exists(&vol.spec.vol_group, &pool)? {
            let free = vg_free_bytes(&vol.spec.vol_group)?;
            new_pool_size = Some(thin_pool_size(free, capacity_bytes(vol)?));
        }
    }

    let args = lvcreate_args(vol, new_pool_size);
    let mut command = std::process::Command::new(LVCREATE);
    command.args(&args);
    execute(&mut command)?;
    Ok(())
}

/// Destroys the logical volume for `vol`. The filesystem signature is
/// wiped before `lvremove` so a later volume reusing the same extents is
/// not detected as carrying a stale superblock. Absent volumes (and
/// volumes that never got a volume group assigned) succeed immediately.
pub fn destroy_volume(vol: &LvmVolume) -> Result<(), Error> {
    if vol.spec.vol_group.is_empty() {
        return Ok(());
    }
    if !volume_exists(vol)? {
        return Ok(());
    }

    let device = dev_path(&vol.spec.vol_group, vol.name());
    let mut wipe = std::process::Command::new(WIPEFS);
    wipe.args(["-af", device.as_str()]);
    execute(&mut wipe)?;

    let mut remove = std::process::Command::new(LVREMOVE);
    remove.args(lvremove_args(vol));
    execute(&mut remove)?;
    Ok(())
}

/// Current size in bytes of `vol`'s LV.
pub fn lv_size_bytes(vol: &LvmVolume) -> Result<u64, Error> {
    let full_name = format!("{}/{}", vol.spec.vol_group, vol.name());
    let mut command = std::process::Command::new(LVS);
    command.args([
        &full_name,
        "--noheadings",
        "-o",
        "lv_size",
        "--units",
        "b",
        "--nosuffix",
    ]);
    let output = execute(&mut command)?;
    let raw = String::from_utf8_lossy(&output.stdout);
    raw.trim().parse::<u64>().map_err(|_| Error::Output {
        command: format!("{LVS} {full_name} -o lv_size"),
        output: raw.trim().to_string(),
    })
}

/// Grows `vol`'s LV to `spec.capacity`.
///
/// `lvextend -r` tolerates repeat invocations at the same size while plain
/// `lvextend` does not, so when the filesystem is not being resized the
/// current size is checked first and an already-large-enough LV succeeds
/// without touching the host.
pub fn resize_volume(vol: &LvmVolume, resize_fs: bool) -> Result<(), Error> {
    if !resize_fs {
        let desired = capacity_bytes(vol)?;
        let current = lv_size_bytes(vol)?;
        if desired <= current {
            return Ok(());
        }
    }

    let mut command = std::process::Command::new(LVEXTEND);
    command.args(lvextend_args(vol, resize_fs));
    execute(&mut command)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvm_types::{ObjectMeta, RaidConfig, YesNo};

    fn volume(name: &str, vg: &str, capacity: &str) -> LvmVolume {
        LvmVolume {
            metadata: ObjectMeta::new("openebs", name),
            spec: VolumeInfo {
                owner_node_id: "node-1".to_string(),
                vol_group: vg.to_string(),
                capacity: capacity.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn mapper_path_doubles_hyphens() {
        assert_eq!(
            device_mapper_path("vg-1", "pvc-abc-def").as_str(),
            "/dev/mapper/vg--1-pvc--abc--def"
        );
        assert_eq!(
            device_mapper_path("lvmvg", "pvc1").as_str(),
            "/dev/mapper/lvmvg-pvc1"
        );
    }

    #[test]
    fn mapper_encoding_decodes_back() {
        for name in ["pvc-abc-def", "plain", "a-b-c-d", "vg-1"] {
            assert_eq!(
                decode_mapper_component(&encode_mapper_component(name)),
                name
            );
        }
    }

    #[test]
    fn lvcreate_args_for_a_plain_volume() {
        let vol = volume("pvc-1", "lvmvg", "1073741824");
        assert_eq!(
            lvcreate_args(&vol, None),
            vec!["-L", "1073741824b", "-n", "pvc-1", "lvmvg", "-y"]
        );
    }

    #[test]
    fn lvcreate_args_for_a_thin_volume_with_existing_pool() {
        let mut vol = volume("pvc-2", "lvmvg", "1073741824");
        vol.spec.thin_provision = YesNo::Yes;
        assert_eq!(
            lvcreate_args(&vol, None),
            vec![
                "-T",
                "lvmvg/lvmvg_thinpool",
                "-V",
                "1073741824b",
                "-n",
                "pvc-2",
                "-y"
            ]
        );
    }

    #[test]
    fn lvcreate_args_size_a_missing_thin_pool() {
        let mut vol = volume("pvc-3", "lvmvg", "2147483648");
        vol.spec.thin_provision = YesNo::Yes;
        assert_eq!(
            lvcreate_args(&vol, Some(1879048192)),
            vec![
                "-L",
                "1879048192b",
                "-T",
                "lvmvg/lvmvg_thinpool",
                "-V",
                "2147483648b",
                "-n",
                "pvc-3",
                "-y"
            ]
        );
    }

    #[test]
    fn lvcreate_args_carry_raid_layout() {
        let mut vol = volume("pvc-4", "lvmvg", "1073741824");
        vol.spec.raid = RaidConfig {
            raid_type: "raid10".parse().unwrap(),
            mirrors: 2,
            stripe_count: 4,
            stripe_size: 64,
            no_sync: YesNo::Yes,
            integrity: YesNo::Yes,
            lv_create_options: Some("--readahead;auto".to_string()),
        };
        assert_eq!(
            lvcreate_args(&vol, None),
            vec![
                "-L",
                "1073741824b",
                "--type",
                "raid10",
                "--mirrors",
                "2",
                "--nosync",
                "--stripes",
                "4",
                "--stripesize",
                "64",
                "--raidintegrity",
                "y",
                "-n",
                "pvc-4",
                "lvmvg",
                "--readahead",
                "auto",
                "-y"
            ]
        );
    }

    #[test]
    fn lvextend_args_optionally_resize_the_filesystem() {
        let vol = volume("pvc-5", "lvmvg", "2147483648");
        assert_eq!(
            lvextend_args(&vol, false),
            vec!["/dev/lvmvg/pvc-5", "-L", "2147483648b"]
        );
        assert_eq!(
            lvextend_args(&vol, true),
            vec!["/dev/lvmvg/pvc-5", "-L", "2147483648b", "-r"]
        );
    }

    #[test]
    fn lvremove_goes_through_the_dev_path() {
        let vol = volume("pvc-6", "lvmvg", "1073741824");
        assert_eq!(lvremove_args(&vol), vec!["-y", "/dev/lvmvg/pvc-6"]);
    }

    #[test]
    fn thin_pool_is_capped_by_free_space_less_the_round_off() {
        let gib = 1024 * 1024 * 1024;
        // Plenty of room: pool matches the request.
        assert_eq!(thin_pool_size(10 * gib, 2 * gib), 2 * gib);
        // Tight: free space less the 256 MiB shave.
        assert_eq!(
            thin_pool_size(2 * gib, 8 * gib),
            2 * gib - MIN_EXTENT_ROUND_OFF_SIZE
        );
        // Degenerate volume group.
        assert_eq!(thin_pool_size(0, gib), 0);
    }
}
