//! Upgrade strategy registry.
//!
//! Each [`UpgraderDescriptor`] declares which product, install variants and
//! version ranges its strategy handles. Lookups take the first matching
//! entry, so more specific strategies must be registered ahead of the
//! general ones they would otherwise be shadowed by.

use strum::Display;

use crate::config::UpgradeConfig;
use crate::error::UpgradeError;
use crate::installation::{InstallVariant, SourceInstallation};
use crate::upgrader::{ThirdGenOemDiskUpgrader, ThirdGenOemUpgrader, ThirdGenUpgrader, Upgrader};
use crate::version::ProductVersion;

/// Concrete upgrade strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UpgraderKind {
    ThirdGen,
    ThirdGenOem,
    ThirdGenOemDisk,
}

/// What a strategy upgrades and how the installer should drive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgraderDescriptor {
    pub kind: UpgraderKind,
    pub product: String,
    pub variants: Vec<InstallVariant>,
    /// Inclusive `(min, max)` ranges.
    pub versions: Vec<(ProductVersion, ProductVersion)>,
    /// The backup stage must run.
    pub requires_backup: bool,
    /// The operator may choose to run the backup stage.
    pub optional_backup: bool,
    /// The operator must pick the target disk.
    pub prompt_for_target: bool,
    /// The disk is repartitioned from scratch by the OEM disk backend.
    pub repartition: bool,
}

impl UpgraderDescriptor {
    fn third_gen_family(
        kind: UpgraderKind,
        config: &UpgradeConfig,
        variant: InstallVariant,
    ) -> Self {
        Self {
            kind,
            product: config.product.clone(),
            variants: vec![variant],
            versions: vec![(ProductVersion::new(5, 5, 0), config.product_version)],
            requires_backup: true,
            optional_backup: false,
            prompt_for_target: false,
            repartition: false,
        }
    }

    /// Series 5 Retail installations.
    pub fn third_gen(config: &UpgradeConfig) -> Self {
        Self::third_gen_family(UpgraderKind::ThirdGen, config, InstallVariant::Retail)
    }

    /// Series 5 OEM Flash and OEM HDD installations.
    pub fn third_gen_oem(config: &UpgradeConfig) -> Self {
        Self {
            prompt_for_target: true,
            ..Self::third_gen_family(UpgraderKind::ThirdGenOem, config, InstallVariant::Oem)
        }
    }

    /// Series 5 OEM installations converted to a Retail layout by the OEM disk backend.
    pub fn third_gen_oem_disk(config: &UpgradeConfig) -> Self {
        Self {
            requires_backup: false,
            repartition: true,
            ..Self::third_gen_family(UpgraderKind::ThirdGenOemDisk, config, InstallVariant::Oem)
        }
    }

    pub fn upgrades(&self, product: &str, version: ProductVersion, variant: InstallVariant) -> bool {
        self.product == product
            && self.variants.contains(&variant)
            && self
                .versions
                .iter()
                .any(|(min, max)| *min <= version && version <= *max)
    }
}

/// Ordered list of strategies.
#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<UpgraderDescriptor>,
}

impl Registry {
    pub fn new(entries: Vec<UpgraderDescriptor>) -> Self {
        Self { entries }
    }

    /// The strategies shipped with a product, in preference order.
    pub fn for_product(config: &UpgradeConfig) -> Self {
        Self::new(vec![
            UpgraderDescriptor::third_gen(config),
            UpgraderDescriptor::third_gen_oem(config),
        ])
    }

    pub fn entries(&self) -> &[UpgraderDescriptor] {
        &self.entries
    }

    /// First strategy that upgrades the given installation.
    pub fn resolve(
        &self,
        product: &str,
        version: ProductVersion,
        variant: InstallVariant,
    ) -> Result<&UpgraderDescriptor, UpgradeError> {
        self.entries
            .iter()
            .find(|d| d.upgrades(product, version, variant))
            .ok_or_else(|| UpgradeError::NotAvailable {
                product: product.to_string(),
                version: version.to_string(),
                variant: variant.to_string(),
            })
    }

    pub fn is_available(&self, product: &str, version: ProductVersion, variant: InstallVariant) -> bool {
        self.entries.iter().any(|d| d.upgrades(product, version, variant))
    }

    pub fn resolve_installation(
        &self,
        source: &SourceInstallation,
    ) -> Result<&UpgraderDescriptor, UpgradeError> {
        self.resolve(&source.product, source.version, source.variant)
    }

    /// Installations that some registered strategy can upgrade.
    pub fn filter_upgradeable<'i>(
        &self,
        installations: &'i [SourceInstallation],
    ) -> Vec<&'i SourceInstallation> {
        installations
            .iter()
            .filter(|s| self.is_available(&s.product, s.version, s.variant))
            .collect()
    }

    /// Builds the strategy for `source`, bound to it for the whole upgrade.
    pub fn instantiate<'a>(
        &self,
        source: &'a mut SourceInstallation,
    ) -> Result<Box<dyn Upgrader + 'a>, UpgradeError> {
        let descriptor = self.resolve_installation(source)?.clone();
        tracing::info!(
            strategy = %descriptor.kind,
            "selected upgrader for {} {} ({})",
            source.product,
            source.version,
            source.variant
        );
        Ok(build(descriptor, source))
    }
}

fn build<'a>(
    descriptor: UpgraderDescriptor,
    source: &'a mut SourceInstallation,
) -> Box<dyn Upgrader + 'a> {
    match descriptor.kind {
        UpgraderKind::ThirdGen => Box::new(ThirdGenUpgrader::new(descriptor, source)),
        UpgraderKind::ThirdGenOem => Box::new(ThirdGenOemUpgrader::new(descriptor, source)),
        UpgraderKind::ThirdGenOemDisk => Box::new(ThirdGenOemDiskUpgrader::new(descriptor, source)),
    }
}
