//! Environment override tests, isolated in their own binary because the
//! process environment is global.

use cascade::Config;

#[test]
fn test_env_overrides_port_and_base_dir() {
    std::env::set_var("CASCADE_NETWORK__PORT", "5511");
    std::env::set_var("CASCADE_STORAGE__BASE_DIR", "/tmp/cascade-env-test");
    let config = Config::load().expect("loads");
    std::env::remove_var("CASCADE_NETWORK__PORT");
    std::env::remove_var("CASCADE_STORAGE__BASE_DIR");

    assert_eq!(config.network.port, 5511);
    assert_eq!(
        config.storage.base_dir,
        Some(std::path::PathBuf::from("/tmp/cascade-env-test"))
    );
}
