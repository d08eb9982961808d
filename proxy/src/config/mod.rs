mod proxy_config;

pub use proxy_config::ProxyConfig;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = ProxyConfig::load("/nonexistent/path/proxy.toml").unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.allowlist_url, "http://localhost:3000/allowedips");
        assert_eq!(config.flush_interval_secs, 3600);
        assert_eq!(config.dial_timeout_secs, 10);
        assert_eq!(config.lookup_timeout_secs, 3);
        assert_eq!(config.relay_buffer_size, 32 * 1024);
        assert!(config.api_addr.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let content = r#"
listen_addr = "127.0.0.1:9090"
api_addr = "127.0.0.1:9091"
flush_interval_secs = 60
"#;
        let file = create_temp_file(content);
        let config = ProxyConfig::load(file.path()).unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9090");
        assert_eq!(config.api_addr.as_deref(), Some("127.0.0.1:9091"));
        assert_eq!(config.flush_interval_secs, 60);
        assert_eq!(config.dial_timeout_secs, 10);
        assert_eq!(config.database_path, "data/ipmeter.db");
    }

    #[test]
    fn parse_invalid_toml_returns_error() {
        let file = create_temp_file("this is not valid toml {{{");
        assert!(ProxyConfig::load(file.path()).is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let file = create_temp_file("dial_timeout_secs = 0");
        let err = ProxyConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("dial_timeout_secs"));
    }

    #[test]
    fn zero_runtime_threads_is_rejected() {
        let file = create_temp_file("runtime_threads = 0");
        assert!(ProxyConfig::load(file.path()).is_err());
    }
}
