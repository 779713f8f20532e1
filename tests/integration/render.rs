#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use bootshim::constants::{EXIT_RENDER_FAILED, EXIT_USAGE};
use common::{bootshim_bin, write_file};
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn render_publishes_substituted_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let template = write_file(dir, "default.conf.tpl", "server_name ${HOST};\nlisten ${PORT};");
    let dest = dir.join("conf.d/default.conf");

    Command::new(bootshim_bin())
        .env("HOST", "example.com")
        .env("PORT", "8080")
        .arg("render")
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dest.display()))
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(&dest).unwrap(),
        "server_name example.com;\nlisten 8080;"
    );
}

#[test]
fn render_fails_on_undefined_variable_and_keeps_old_config() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let template = write_file(dir, "t.tpl", "listen ${BOOTSHIM_TEST_UNSET_PORT};");
    let dest = write_file(dir, "out.conf", "listen 80;");

    Command::new(bootshim_bin())
        .env_remove("BOOTSHIM_TEST_UNSET_PORT")
        .arg("render")
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dest.display()))
        .assert()
        .code(EXIT_RENDER_FAILED)
        .stderr(predicate::str::contains("BOOTSHIM_TEST_UNSET_PORT"));

    assert_eq!(fs::read_to_string(&dest).unwrap(), "listen 80;");
}

#[test]
fn allow_undefined_substitutes_empty() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let template = write_file(dir, "t.tpl", "listen ${BOOTSHIM_TEST_UNSET_PORT};");

    Command::new(bootshim_bin())
        .env_remove("BOOTSHIM_TEST_UNSET_PORT")
        .arg("render")
        .arg("--allow-undefined")
        .arg("--stdout")
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dir.join("unused").display()))
        .assert()
        .success()
        .stdout("listen ;");

    assert!(!dir.join("unused").exists());
}

#[test]
fn render_check_does_not_write() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let template = write_file(dir, "t.tpl", "root ${DOC_ROOT:-/srv/www};");
    let dest = dir.join("out.conf");

    Command::new(bootshim_bin())
        .arg("render")
        .arg("--check")
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dest.display()))
        .assert()
        .success()
        .stderr(predicate::str::contains("references [DOC_ROOT]"));

    assert!(!dest.exists());
}

#[test]
fn env_file_supplies_missing_variables() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let template = write_file(dir, "t.tpl", "proxy_pass http://${APP_HOST}:${APP_PORT};");
    let env_file = write_file(dir, "proxy.env", "APP_HOST=app\nAPP_PORT=8000\n");

    Command::new(bootshim_bin())
        .env("APP_PORT", "9000")
        .env_remove("APP_HOST")
        .arg("render")
        .arg("--stdout")
        .arg("--env-file")
        .arg(&env_file)
        .arg("-t")
        .arg(format!("{}:{}", template.display(), dir.join("out").display()))
        .assert()
        .success()
        .stdout("proxy_pass http://app:9000;");
}

#[test]
fn config_file_drives_rendering() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    write_file(dir, "site.tpl", "listen ${LISTEN_PORT}; set $upstream ${UPSTREAM};");
    let config = write_file(
        dir,
        "bootshim.yaml",
        r#"
templates:
  - source: site.tpl
    destination: rendered/site.conf
    mode: "0600"
only: [LISTEN_PORT]
"#,
    );

    Command::new(bootshim_bin())
        .env("LISTEN_PORT", "8443")
        .arg("--config")
        .arg(&config)
        .arg("render")
        .assert()
        .success();

    assert_eq!(
        fs::read_to_string(dir.join("rendered/site.conf")).unwrap(),
        "listen 8443; set $upstream ${UPSTREAM};"
    );
}

#[test]
fn missing_config_file_is_usage_error() {
    let temp = tempdir().expect("failed to create tempdir");

    Command::new(bootshim_bin())
        .arg("--config")
        .arg(temp.path().join("absent.yaml"))
        .arg("render")
        .assert()
        .code(EXIT_USAGE);
}

#[test]
fn missing_template_is_render_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    Command::new(bootshim_bin())
        .arg("render")
        .arg("-t")
        .arg(format!(
            "{}:{}",
            dir.join("absent.tpl").display(),
            dir.join("out.conf").display()
        ))
        .assert()
        .code(EXIT_RENDER_FAILED)
        .stderr(predicate::str::contains("absent.tpl"));

    assert!(!dir.join("out.conf").exists());
}
