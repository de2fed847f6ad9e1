//! Core identifiers and enums shared by every snapchain module

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name)
                    .map_err(|_| format!("Invalid {} id '{}'", $label, s))
            }
        }
    };
}

id_type!(
    /// Logical snapshot id
    SnapshotId,
    "snapshot"
);
id_type!(
    /// Row id of a snapshot-at-a-datastore reference
    RefId,
    "snapshot store ref"
);
id_type!(
    /// Volume id
    VolumeId,
    "volume"
);
id_type!(
    /// Primary pool, image store or cache store id
    DataStoreId,
    "datastore"
);
id_type!(VmId, "vm");
id_type!(VmSnapshotId, "vm snapshot");
id_type!(HostId, "host");

/// Role a datastore plays for a snapshot reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataStoreRole {
    /// Block storage the volume lives on
    Primary,
    /// Secondary storage (backup archive)
    Image,
    /// Transient staging store
    ImageCache,
}

impl DataStoreRole {
    pub const ALL: [DataStoreRole; 3] = [
        DataStoreRole::Primary,
        DataStoreRole::Image,
        DataStoreRole::ImageCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataStoreRole::Primary => "primary",
            DataStoreRole::Image => "image",
            DataStoreRole::ImageCache => "cache",
        }
    }
}

impl fmt::Display for DataStoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DataStoreRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(DataStoreRole::Primary),
            "image" | "secondary" => Ok(DataStoreRole::Image),
            "cache" | "imagecache" => Ok(DataStoreRole::ImageCache),
            _ => Err(format!(
                "Invalid datastore role '{}'. Must be primary, image, or cache",
                s
            )),
        }
    }
}

/// Where the authoritative copy of a snapshot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationType {
    Primary,
    Secondary,
}

/// How a snapshot came to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotType {
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Recurring,
    Group,
}

impl SnapshotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotType::Manual => "manual",
            SnapshotType::Hourly => "hourly",
            SnapshotType::Daily => "daily",
            SnapshotType::Weekly => "weekly",
            SnapshotType::Monthly => "monthly",
            SnapshotType::Recurring => "recurring",
            SnapshotType::Group => "group",
        }
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hypervisor class backing a volume or VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HypervisorType {
    XenServer,
    Kvm,
    VMware,
    HyperV,
    Simulator,
}

impl HypervisorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HypervisorType::XenServer => "XenServer",
            HypervisorType::Kvm => "KVM",
            HypervisorType::VMware => "VMware",
            HypervisorType::HyperV => "Hyperv",
            HypervisorType::Simulator => "Simulator",
        }
    }
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HypervisorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "xenserver" | "xen" => Ok(HypervisorType::XenServer),
            "kvm" => Ok(HypervisorType::Kvm),
            "vmware" => Ok(HypervisorType::VMware),
            "hyperv" => Ok(HypervisorType::HyperV),
            "simulator" => Ok(HypervisorType::Simulator),
            _ => Err(format!("Invalid hypervisor type '{}'", s)),
        }
    }
}

/// On-disk format of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Vhd,
    Vmdk,
    Ova,
    Iso,
}

impl ImageFormat {
    /// Formats a storage system may revert in place
    pub const REVERTIBLE: [ImageFormat; 3] =
        [ImageFormat::Qcow2, ImageFormat::Raw, ImageFormat::Vhd];

    pub fn is_revertible(&self) -> bool {
        Self::REVERTIBLE.contains(self)
    }

    /// The host must drop its access while the backing LUN is rewritten,
    /// because the SR signature changes underneath it.
    pub fn requires_host_resignature(&self) -> bool {
        matches!(self, ImageFormat::Vhd | ImageFormat::Vmdk)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFormat::Qcow2 => "QCOW2",
            ImageFormat::Raw => "RAW",
            ImageFormat::Vhd => "VHD",
            ImageFormat::Vmdk => "VMDK",
            ImageFormat::Ova => "OVA",
            ImageFormat::Iso => "ISO",
        };
        write!(f, "{}", s)
    }
}

/// Kind of a VM-level snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSnapshotType {
    Disk,
    DiskAndMemory,
}

impl fmt::Display for VmSnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmSnapshotType::Disk => write!(f, "Disk"),
            VmSnapshotType::DiskAndMemory => write!(f, "DiskAndMemory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_and_display() {
        let id: SnapshotId = " 42".parse().unwrap();
        assert_eq!(id, SnapshotId(42));
        assert_eq!(id.to_string(), "42");
        assert!("abc".parse::<VolumeId>().is_err());
    }

    #[test]
    fn role_accepts_aliases() {
        assert_eq!("secondary".parse::<DataStoreRole>(), Ok(DataStoreRole::Image));
        assert_eq!("Cache".parse::<DataStoreRole>(), Ok(DataStoreRole::ImageCache));
        assert!("tape".parse::<DataStoreRole>().is_err());
    }

    #[test]
    fn revertible_formats() {
        assert!(ImageFormat::Qcow2.is_revertible());
        assert!(ImageFormat::Vhd.is_revertible());
        assert!(!ImageFormat::Ova.is_revertible());
        assert!(ImageFormat::Vhd.requires_host_resignature());
        assert!(!ImageFormat::Qcow2.requires_host_resignature());
    }
}
