//! Provisioner variants and their selection.

use std::fmt;

use super::os_release::OsRelease;

/// Marker key that identifies pre-baked container images.
pub const CONTAINER_MARKER: &str = "MACHINA_CONTAINER_OS";

/// Package manager used to install prerequisites.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackageManager {
    /// Debian family `apt-get`.
    Apt,
    /// Red Hat family `yum`.
    Yum,
}

/// OS families the provisioner knows how to configure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Variant {
    /// Ubuntu with systemd.
    Ubuntu,
    /// CentOS.
    CentOs,
    /// Fedora.
    Fedora,
    /// Oracle Linux.
    OracleLinux,
    /// Minimal Buildroot ISO with the runtime baked in.
    Buildroot,
    /// Pre-baked container image; every prerequisite is already present.
    Container,
}

/// Variants in selection order; the first compatible one wins.
pub const REGISTRY: [Variant; 6] = [
    Variant::Ubuntu,
    Variant::CentOs,
    Variant::Fedora,
    Variant::OracleLinux,
    Variant::Buildroot,
    Variant::Container,
];

impl Variant {
    /// Returns the variant's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu(systemd)",
            Self::CentOs => "centos",
            Self::Fedora => "fedora",
            Self::OracleLinux => "ol",
            Self::Buildroot => "buildroot",
            Self::Container => "container",
        }
    }

    /// Returns whether this variant can provision a host reporting
    /// `release`.
    #[must_use]
    pub fn compatible_with(self, release: &OsRelease) -> bool {
        match self {
            Self::Ubuntu => release.id == "ubuntu",
            Self::CentOs => release.id == "centos",
            Self::Fedora => release.id == "fedora",
            Self::OracleLinux => release.id == "ol",
            Self::Buildroot => release.id == "buildroot",
            Self::Container => {
                release.id == "container" || release.extras.contains_key(CONTAINER_MARKER)
            }
        }
    }

    /// Picks the first compatible variant from [`REGISTRY`].
    #[must_use]
    pub fn select(release: &OsRelease) -> Option<Self> {
        REGISTRY
            .into_iter()
            .find(|variant| variant.compatible_with(release))
    }

    /// Returns the package manager, if the variant installs anything.
    #[must_use]
    pub const fn package_manager(self) -> Option<PackageManager> {
        match self {
            Self::Ubuntu => Some(PackageManager::Apt),
            Self::CentOs | Self::Fedora | Self::OracleLinux => Some(PackageManager::Yum),
            Self::Buildroot | Self::Container => None,
        }
    }

    /// Returns whether the runtime is managed by systemd and therefore
    /// configured through a drop-in unit.
    #[must_use]
    pub const fn uses_systemd(self) -> bool {
        !matches!(self, Self::Container)
    }

    /// Returns whether the runtime ships with the image.
    #[must_use]
    pub const fn runtime_prebaked(self) -> bool {
        matches!(self, Self::Buildroot | Self::Container)
    }

    /// Returns the storage driver used when the user picked none.
    ///
    /// Ubuntu releases before 15.04 predate overlay support in the runtime
    /// and default to `aufs`.
    #[must_use]
    pub fn default_storage_driver(self, release: &OsRelease) -> &'static str {
        if self == Self::Ubuntu {
            let version = release.version_numbers();
            let major = version.first().copied().unwrap_or(u32::MAX);
            let minor = version.get(1).copied().unwrap_or(0);
            if (major, minor) < (15, 4) {
                return "aufs";
            }
        }
        "overlay2"
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ID=ubuntu\nVERSION_ID=\"16.04\"", Some(Variant::Ubuntu))]
    #[case("ID=\"centos\"\nID_LIKE=\"rhel fedora\"", Some(Variant::CentOs))]
    #[case("ID=fedora", Some(Variant::Fedora))]
    #[case("ID=\"ol\"", Some(Variant::OracleLinux))]
    #[case("ID=buildroot", Some(Variant::Buildroot))]
    #[case("ID=container", Some(Variant::Container))]
    #[case("ID=alpine\nMACHINA_CONTAINER_OS=1", Some(Variant::Container))]
    #[case("ID=rhel\nID_LIKE=fedora", None)]
    #[case("ID=arch", None)]
    fn selects_by_id(#[case] text: &str, #[case] expected: Option<Variant>) {
        assert_eq!(Variant::select(&OsRelease::parse(text)), expected);
    }

    #[rstest]
    #[case("16.04", "overlay2")]
    #[case("14.04", "aufs")]
    #[case("22.04", "overlay2")]
    fn ubuntu_storage_default_follows_the_release(#[case] version: &str, #[case] expected: &str) {
        let release = OsRelease::parse(&format!("ID=ubuntu\nVERSION_ID={version}"));
        assert_eq!(Variant::Ubuntu.default_storage_driver(&release), expected);
    }

    #[test]
    fn prebaked_variants_install_nothing() {
        for variant in [Variant::Buildroot, Variant::Container] {
            assert!(variant.runtime_prebaked());
            assert_eq!(variant.package_manager(), None);
        }
        assert_eq!(Variant::Fedora.package_manager(), Some(PackageManager::Yum));
        assert!(!Variant::Container.uses_systemd());
    }
}
