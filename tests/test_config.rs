use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use webserv::config::{MatchKind, Method, DEFAULT_MAX_BODY_SIZE};
use webserv::{Config, ServerError};

#[test]
fn test_minimal_config_gets_defaults() {
    let config = Config::from_toml("[[server]]\nport = 8080\n").unwrap();

    assert_eq!(config.runtime.max_events, 64);
    assert_eq!(config.runtime.cgi_timeout, Duration::from_secs(30));
    assert_eq!(config.runtime.max_cgi_output, 16 * 1024 * 1024);
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.file.is_none());

    let server = &config.servers[0];
    assert_eq!(server.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(server.root, PathBuf::from("www"));
    assert_eq!(server.index, vec!["index.html".to_string()]);
    assert_eq!(server.client_max_body_size, DEFAULT_MAX_BODY_SIZE);
    assert!(!server.autoindex);
    assert!(server.locations.is_empty());
}

#[test]
fn test_full_config() {
    let config = Config::from_toml(
        r#"
        [runtime]
        poll_timeout_ms = 250
        max_events = 128
        cgi_timeout_secs = 5
        client_timeout_secs = 10
        max_request_bytes = "4m"
        max_cgi_output = "2m"

        [logging]
        level = "DEBUG"
        file = "/tmp/webserv.log"

        [[server]]
        host = "localhost"
        port = 8081
        server_names = ["a.test"]
        root = "site"
        index = ["home.html", "index.htm"]
        autoindex = true
        client_max_body_size = "1M"
        error_pages = { "404" = "/404.html", "500" = "/50x.html" }

        [[server.location]]
        path = "/upload"
        methods = ["POST", "DELETE"]
        upload_enabled = true
        upload_store = "/tmp/uploads"

        [[server.location]]
        path = "/old"
        match = "exact"
        redirect = { status = 301, target = "/new" }

        [[server.location]]
        path = "/cgi-bin/"
        cgi = { ".py" = "/usr/bin/python3", ".sh" = "/bin/sh" }
        "#,
    )
    .unwrap();

    assert_eq!(config.runtime.poll_timeout_ms, 250);
    assert_eq!(config.runtime.max_request_bytes, 4 * 1024 * 1024);
    assert_eq!(config.runtime.max_cgi_output, 2 * 1024 * 1024);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/webserv.log")));

    let server = &config.servers[0];
    assert_eq!(server.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    assert_eq!(server.client_max_body_size, 1024 * 1024);
    assert_eq!(server.error_pages.get(&500).map(String::as_str), Some("/50x.html"));

    let upload = &server.locations[0];
    assert_eq!(upload.kind, MatchKind::Prefix);
    assert!(upload.methods.contains(&Method::Post));
    assert!(!upload.methods.contains(&Method::Get));
    assert_eq!(upload.upload_store, Some(PathBuf::from("/tmp/uploads")));

    let old = &server.locations[1];
    assert_eq!(old.kind, MatchKind::Exact);
    assert_eq!(old.redirect.as_ref().map(|r| r.status), Some(301));

    let cgi = &server.locations[2];
    assert_eq!(cgi.cgi.get(".sh"), Some(&PathBuf::from("/bin/sh")));

    let printed = config.to_string();
    assert!(printed.contains("location = /old"));
    assert!(printed.contains("cgi .py /usr/bin/python3"));
}

#[test]
fn test_errors_carry_line_and_column() {
    let err = Config::from_toml("[[server]]\nport = 8080\nbogus = 1\n").unwrap_err();
    assert_eq!(err.line, 3);

    let err = Config::from_toml("[[server]]\nport = 8080\nclient_max_body_size = \"12q\"\n")
        .unwrap_err();
    assert_eq!(err.line, 3);
    assert!(err.message.contains("unit"), "{}", err);
    assert!(err.to_string().starts_with("line 3, column "));
}

#[test]
fn test_validation_failures() {
    let cases = [
        "",
        "[[server]]\nport = 0\n",
        "[[server]]\nport = 80\nhost = \"not-an-ip\"\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"relative\"\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\nmethods = [\"PUT\"]\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\nmethods = []\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\nupload_enabled = true\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\nredirect = { status = 200, target = \"/b\" }\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\ncgi = { \"py\" = \"/usr/bin/python3\" }\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\n[[server.location]]\npath = \"/a\"\n",
        "[[server]]\nport = 80\n[[server.location]]\npath = \"/a\"\n[[server.location]]\npath = \"/a\"\nmatch = \"exact\"\n",
        "[runtime]\nmax_cgi_output = \"lots\"\n[[server]]\nport = 80\n",
        "[[server]]\nport = 80\nerror_pages = { \"99\" = \"/x.html\" }\n",
        "[runtime]\nmax_events = 0\n[[server]]\nport = 80\n",
        "[logging]\nlevel = \"loud\"\n[[server]]\nport = 80\n",
    ];
    for case in cases.iter() {
        assert!(Config::from_toml(case).is_err(), "accepted:\n{}", case);
    }
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[[server]]\nport = 8082\nserver_names = [\"file.test\"]").unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.servers[0].port, 8082);

    let missing = Config::load("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(missing, ServerError::Io(_)));
}
