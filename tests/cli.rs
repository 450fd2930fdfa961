use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

fn boxvm() -> assert_cmd::Command {
    cargo_bin_cmd!("boxvm").into()
}

fn catalog_present() -> bool {
    std::path::Path::new("/config/distros.yaml").exists()
}

#[test]
fn help_works() {
    boxvm()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Container-hosted VM supervisor"));
}

#[test]
fn help_lists_flags() {
    boxvm()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--list-distros")
                .and(predicate::str::contains("--show-config"))
                .and(predicate::str::contains("--show-xml"))
                .and(predicate::str::contains("--dry-run"))
                .and(predicate::str::contains("--no-console")),
        );
}

#[test]
fn unknown_flag_is_rejected() {
    boxvm().arg("--bogus").assert().failure();
}

#[test]
fn missing_catalog_is_a_single_clean_error() {
    if catalog_present() {
        return; // environment ships a catalog; covered by the success path
    }
    boxvm()
        .arg("--show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("distribution catalog missing"));
}

#[test]
fn show_config_masks_secrets() {
    if !catalog_present() {
        return;
    }
    boxvm()
        .arg("--show-config")
        .env("GUEST_PASSWORD", "super-secret-value")
        .env("GUEST_NAME", "cli-test-vm")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("vm_name: cli-test-vm")
                .and(predicate::str::contains("********"))
                .and(predicate::str::contains("super-secret-value").not()),
        );
}

#[test]
fn port_conflict_fails_before_any_libvirt_work() {
    if !catalog_present() {
        return;
    }
    boxvm()
        .env("SSH_PORT", "8080")
        .env("PORT_FWD", "8080:80")
        .arg("--show-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("port conflict"));
}

#[test]
fn show_xml_renders_a_domain_document() {
    if !catalog_present() {
        return;
    }
    boxvm()
        .arg("--show-xml")
        .env("GUEST_NAME", "cli-xml-vm")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("<domain")
                .and(predicate::str::contains("<name>cli-xml-vm</name>"))
                .and(predicate::str::contains("org.qemu.guest_agent.0")),
        );
}
