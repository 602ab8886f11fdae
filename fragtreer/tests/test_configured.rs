use figment::{
    providers::{Format, Toml},
    Figment,
};

use fragtree::TreeBuilderKind;

#[test_log::test]
#[test_log(default_log_filter = "debug")]
fn test_glucose() {
    let mut config = Figment::new();
    config = config.merge(Toml::file_exact("../test/data/glucose.toml"));
    let driver: fragtreer::FragTreer = config.extract().unwrap();
    assert_eq!(driver.max_trees, Some(2));
    assert_eq!(driver.analysis.tree_builder, TreeBuilderKind::Greedy);
    assert_eq!(driver.analysis.scoring.loss_size, Some((3.5, 1.2)));

    let resolved = driver.resolve_config().unwrap();
    assert_eq!(resolved.max_trees, 2);
    assert_eq!(resolved.threads, 2);
    assert!(resolved.recalibration);
    assert_eq!(resolved.max_colors, 10);
    driver.main().unwrap();
}
