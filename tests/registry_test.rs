use hostupgrade::config::UpgradeConfig;
use hostupgrade::error::UpgradeError;
use hostupgrade::installation::{InstallVariant, SourceInstallation};
use hostupgrade::registry::{Registry, UpgraderDescriptor, UpgraderKind};
use hostupgrade::version::ProductVersion;

fn install(product: &str, version: ProductVersion, variant: InstallVariant) -> SourceInstallation {
    SourceInstallation::new(product, version, variant, "/dev/sda")
}

#[test]
fn each_variant_resolves_to_its_strategy() {
    let config = UpgradeConfig::default();
    let registry = Registry::for_product(&config);

    let retail = registry
        .resolve("xenenterprise", ProductVersion::new(5, 5, 0), InstallVariant::Retail)
        .unwrap();
    assert_eq!(retail.kind, UpgraderKind::ThirdGen);

    let oem = registry
        .resolve("xenenterprise", ProductVersion::new(5, 6, 0), InstallVariant::Oem)
        .unwrap();
    assert_eq!(oem.kind, UpgraderKind::ThirdGenOem);
    assert!(oem.prompt_for_target);
}

#[test]
fn first_registered_match_wins() {
    let config = UpgradeConfig::default();
    let registry = Registry::new(vec![
        UpgraderDescriptor::third_gen_oem_disk(&config),
        UpgraderDescriptor::third_gen_oem(&config),
    ]);
    let found = registry
        .resolve("xenenterprise", ProductVersion::new(5, 5, 0), InstallVariant::Oem)
        .unwrap();
    assert_eq!(found.kind, UpgraderKind::ThirdGenOemDisk);
}

#[test]
fn unknown_installation_is_not_available() {
    let config = UpgradeConfig::default();
    let registry = Registry::for_product(&config);

    let err = registry
        .resolve("otherproduct", ProductVersion::new(5, 5, 0), InstallVariant::Retail)
        .unwrap_err();
    assert!(matches!(err, UpgradeError::NotAvailable { .. }));
    assert_eq!(err.to_string(), "no upgrader available for otherproduct 5.5.0 (Retail)");

    let err = registry
        .resolve("xenenterprise", ProductVersion::new(4, 1, 0), InstallVariant::Oem)
        .unwrap_err();
    assert_eq!(err.to_string(), "no upgrader available for xenenterprise 4.1.0 (OEM)");
}

#[test]
fn filter_keeps_upgradeable_installations_in_order() {
    let config = UpgradeConfig::default();
    let registry = Registry::for_product(&config);
    let installs = vec![
        install("xenenterprise", ProductVersion::new(5, 6, 0), InstallVariant::Oem),
        install("xenenterprise", ProductVersion::new(4, 1, 0), InstallVariant::Retail),
        install("xenenterprise", ProductVersion::new(5, 5, 0), InstallVariant::Retail),
        install("xenenterprise", ProductVersion::new(6, 0, 0), InstallVariant::Retail),
    ];

    let upgradeable = registry.filter_upgradeable(&installs);
    let versions: Vec<String> = upgradeable.iter().map(|s| s.version.to_string()).collect();
    assert_eq!(versions, vec!["5.6.0", "5.5.0"]);
    assert!(registry.filter_upgradeable(&[]).is_empty());
}

#[test]
fn instantiated_upgrader_is_bound_to_installation() {
    let config = UpgradeConfig::default();
    let registry = Registry::for_product(&config);
    let mut src = install("xenenterprise", ProductVersion::new(5, 5, 0), InstallVariant::Oem);

    let upgrader = registry.instantiate(&mut src).unwrap();
    assert_eq!(upgrader.descriptor().kind, UpgraderKind::ThirdGenOem);
    assert_eq!(upgrader.installation().version, ProductVersion::new(5, 5, 0));
}

#[test]
fn instantiate_rejects_unsupported_installation() {
    let config = UpgradeConfig::default();
    let registry = Registry::for_product(&config);
    let mut src = install("xenenterprise", ProductVersion::new(7, 0, 0), InstallVariant::Retail);

    assert!(matches!(
        registry.instantiate(&mut src),
        Err(UpgradeError::NotAvailable { .. })
    ));
}
