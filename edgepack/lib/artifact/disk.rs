use std::{fmt, str::FromStr};

use crate::{media, EdgepackError};

use super::Source;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The on-disk format of a disk image layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiskKind {
    /// Raw disk image.
    Raw,

    /// VMware VMDK.
    Vmdk,

    /// Hyper-V VHD.
    Vhd,

    /// ISO 9660 image.
    Iso,

    /// QEMU copy-on-write, first generation.
    Qcow,

    /// QEMU copy-on-write, second generation.
    Qcow2,

    /// Open Virtualization Appliance.
    Ova,

    /// Hyper-V VHDX.
    Vhdx,
}

/// A disk image source together with its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    /// Where the disk bytes come from.
    pub source: Source,

    /// The disk format.
    pub kind: DiskKind,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DiskKind {
    /// The lowercase name used on the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            DiskKind::Raw => "raw",
            DiskKind::Vmdk => "vmdk",
            DiskKind::Vhd => "vhd",
            DiskKind::Iso => "iso",
            DiskKind::Qcow => "qcow",
            DiskKind::Qcow2 => "qcow2",
            DiskKind::Ova => "ova",
            DiskKind::Vhdx => "vhdx",
        }
    }

    /// The custom media type carried by layers of this disk kind.
    pub fn media_type(&self) -> &'static str {
        match self {
            DiskKind::Raw => media::MEDIA_TYPE_ECI_DISK_RAW,
            DiskKind::Vmdk => media::MEDIA_TYPE_ECI_DISK_VMDK,
            DiskKind::Vhd => media::MEDIA_TYPE_ECI_DISK_VHD,
            DiskKind::Iso => media::MEDIA_TYPE_ECI_DISK_ISO,
            DiskKind::Qcow => media::MEDIA_TYPE_ECI_DISK_QCOW,
            DiskKind::Qcow2 => media::MEDIA_TYPE_ECI_DISK_QCOW2,
            DiskKind::Ova => media::MEDIA_TYPE_ECI_DISK_OVA,
            DiskKind::Vhdx => media::MEDIA_TYPE_ECI_DISK_VHDX,
        }
    }

    /// Maps a custom disk media type back to its kind.
    pub fn from_media_type(media_type: &str) -> Option<DiskKind> {
        match media_type {
            media::MEDIA_TYPE_ECI_DISK_RAW => Some(DiskKind::Raw),
            media::MEDIA_TYPE_ECI_DISK_VMDK => Some(DiskKind::Vmdk),
            media::MEDIA_TYPE_ECI_DISK_VHD => Some(DiskKind::Vhd),
            media::MEDIA_TYPE_ECI_DISK_ISO => Some(DiskKind::Iso),
            media::MEDIA_TYPE_ECI_DISK_QCOW => Some(DiskKind::Qcow),
            media::MEDIA_TYPE_ECI_DISK_QCOW2 => Some(DiskKind::Qcow2),
            media::MEDIA_TYPE_ECI_DISK_OVA => Some(DiskKind::Ova),
            media::MEDIA_TYPE_ECI_DISK_VHDX => Some(DiskKind::Vhdx),
            _ => None,
        }
    }
}

impl Disk {
    /// Creates a disk from a source and kind.
    pub fn new(source: Source, kind: DiskKind) -> Self {
        Self { source, kind }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for DiskKind {
    type Err = EdgepackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(DiskKind::Raw),
            "vmdk" => Ok(DiskKind::Vmdk),
            "vhd" => Ok(DiskKind::Vhd),
            "iso" => Ok(DiskKind::Iso),
            "qcow" => Ok(DiskKind::Qcow),
            "qcow2" => Ok(DiskKind::Qcow2),
            "ova" => Ok(DiskKind::Ova),
            "vhdx" => Ok(DiskKind::Vhdx),
            other => Err(EdgepackError::UnknownDiskKind(other.to_string())),
        }
    }
}

impl fmt::Display for DiskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_kind_name_round_trips() {
        for kind in [
            DiskKind::Raw,
            DiskKind::Vmdk,
            DiskKind::Vhd,
            DiskKind::Iso,
            DiskKind::Qcow,
            DiskKind::Qcow2,
            DiskKind::Ova,
            DiskKind::Vhdx,
        ] {
            assert_eq!(kind.name().parse::<DiskKind>().unwrap(), kind);
            assert_eq!(DiskKind::from_media_type(kind.media_type()), Some(kind));
        }
    }

    #[test]
    fn test_disk_kind_rejects_unknown_names() {
        assert!(matches!(
            "floppy".parse::<DiskKind>(),
            Err(EdgepackError::UnknownDiskKind(_))
        ));
        assert_eq!(DiskKind::from_media_type("application/octet-stream"), None);
    }

    #[test]
    fn test_disk_kind_ordering_is_stable() {
        assert!(DiskKind::Raw < DiskKind::Vmdk);
        assert!(DiskKind::Vmdk < DiskKind::Vhd);
        assert!(DiskKind::Ova < DiskKind::Vhdx);
    }
}
