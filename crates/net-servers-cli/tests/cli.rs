use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Sandboxed working directory for one CLI scenario.
///
/// `CONTAINER_CMD` points at a binary that does not exist, so every test
/// runs without a container runtime: projections are written, reloads are
/// disabled.
struct TestContext {
    root: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("net-servers").expect("binary builds");
        cmd.current_dir(self.root.path());
        cmd.env_remove("NET_SERVERS_BASE");
        cmd.env_remove("NET_SERVERS_ENV");
        cmd.env("CONTAINER_CMD", "no-such-container-runtime");
        cmd
    }

    fn dev_base(&self) -> PathBuf {
        self.root.path().join("data/development")
    }

    fn init(&self) {
        self.command()
            .args(["environments", "init"])
            .assert()
            .success();
        self.command().args(["config", "init"]).assert().success();
    }

    fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.dev_base().join(relative))
            .unwrap_or_else(|e| panic!("reading {relative}: {e}"))
    }
}

#[test]
fn environments_init_creates_registry_and_tree() {
    let t = TestContext::new();
    t.command()
        .args(["environments", "init"])
        .assert()
        .success();
    assert!(t.root.path().join("environments.yaml").exists());
    assert!(t.dev_base().join("config").is_dir());

    t.command()
        .args(["environments", "current"])
        .assert()
        .success()
        .stdout(predicate::str::contains("development"));

    // Re-init refuses without force.
    t.command()
        .args(["environments", "init"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn missing_registry_is_a_not_found_error() {
    let t = TestContext::new();
    t.command()
        .args(["--json", "environments", "list"])
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("ENV_NOT_FOUND"));
}

#[test]
fn config_init_writes_documented_defaults() {
    let t = TestContext::new();
    t.init();

    let users = t.read("config/users.yaml");
    assert!(users.contains("username: admin"));
    let domains = t.read("config/domains.yaml");
    assert!(domains.contains("name: local.dev"));
    assert!(t.dev_base().join("config/services/services.yaml").exists());
    assert!(t.dev_base().join("config/secrets.yaml").exists());

    t.command()
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid"));
}

#[test]
fn set_password_and_sync_materializes_every_projection() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args([
            "config",
            "user",
            "set-password",
            "admin",
            "--password",
            "s3cret",
        ])
        .assert()
        .success();

    t.command()
        .args(["config", "sync", "--skip-reload"])
        .assert()
        .success();

    assert_eq!(t.read("state/mail/virtual_domains"), "local.dev OK\n");
    assert_eq!(
        t.read("state/mail/virtual_mailboxes"),
        "admin@local.dev local.dev/admin/\n"
    );
    assert!(t
        .read("state/mail/dovecot-users")
        .contains("admin@local.dev:{PLAIN}s3cret"));

    let htdigest = t.read("state/apache/auth/WebDAV Secure Area.htdigest");
    let line = htdigest.lines().next().expect("one htdigest entry");
    let mut parts = line.splitn(3, ':');
    assert_eq!(parts.next(), Some("admin"));
    assert_eq!(parts.next(), Some("WebDAV Secure Area"));
    let ha1 = parts.next().expect("digest field");
    assert_eq!(ha1.len(), 32);
    assert!(ha1.chars().all(|c| c.is_ascii_hexdigit()));

    assert!(t
        .read("state/dns/zones/db.local.dev.zone")
        .contains("; serial"));
    assert!(t.dev_base().join("state/mail/vhosts/local.dev/admin").is_dir());

    // The secret itself never leaks into the users document.
    assert!(!t.read("config/users.yaml").contains("s3cret"));
}

#[test]
fn user_add_and_delete_round_trip_the_projections() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args([
            "config",
            "user",
            "add",
            "alice",
            "--email",
            "alice@local.dev",
            "--domain",
            "local.dev",
            "--password",
            "wonderland",
        ])
        .assert()
        .success();

    assert!(t
        .read("state/mail/virtual_mailboxes")
        .contains("alice@local.dev local.dev/alice/"));

    // Duplicate usernames are rejected with the validation exit code.
    t.command()
        .args([
            "config",
            "user",
            "add",
            "alice",
            "--email",
            "alice@local.dev",
            "--domain",
            "local.dev",
        ])
        .assert()
        .failure()
        .code(2);

    t.command()
        .args(["config", "user", "delete", "alice"])
        .assert()
        .success();
    assert!(!t
        .read("state/mail/virtual_mailboxes")
        .contains("alice@local.dev"));
    assert!(!t.dev_base().join("state/mail/vhosts/local.dev/alice").exists());
}

#[test]
fn user_add_rejects_unknown_domain() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args([
            "--json",
            "config",
            "user",
            "add",
            "bob",
            "--email",
            "bob@nowhere.dev",
            "--domain",
            "nowhere.dev",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("CONFIG_VALIDATE"));

    // Nothing was committed.
    assert!(!t.read("config/users.yaml").contains("bob"));
}

#[test]
fn domain_add_updates_zone_and_mail_projections() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args([
            "config",
            "domain",
            "add",
            "example.dev",
            "--mx",
            "mail",
            "--a",
            "mail=10.0.0.2",
            "--a",
            "www=10.0.0.3",
            "--certificate-mode",
            "none",
        ])
        .assert()
        .success();

    assert!(t.dev_base().join("state/dns/zones/db.example.dev.zone").exists());
    assert!(t.read("state/mail/virtual_domains").contains("example.dev OK"));

    t.command()
        .args(["--json", "config", "domain", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("example.dev"));
}

#[test]
fn self_signed_provisioning_writes_the_pem_triple() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args(["certificates", "provision-self-signed", "local.dev"])
        .assert()
        .success();

    let cert_dir = t.dev_base().join("state/certificates/local.dev");
    for name in ["cert.pem", "privkey.pem", "fullchain.pem", "meta.yaml"] {
        assert!(cert_dir.join(name).exists(), "{name} missing");
    }

    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(cert_dir.join("privkey.pem"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    t.command()
        .args(["--json", "certificates", "info", "local.dev"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fingerprint_sha256"));

    // Provisioning an unknown domain is a validation failure.
    t.command()
        .args(["certificates", "provision-self-signed", "ghost.dev"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn switching_environments_isolates_derived_state() {
    let t = TestContext::new();
    t.init();
    t.command()
        .args(["config", "sync", "--skip-reload"])
        .assert()
        .success();
    let before = t.read("state/mail/virtual_mailboxes");

    let testing_base = t.root.path().join("data/testing");
    t.command()
        .args([
            "environments",
            "add",
            "testing",
            "--base-path",
            testing_base.to_str().unwrap(),
            "--domain",
            "test.dev",
            "--admin-email",
            "admin@test.dev",
        ])
        .assert()
        .success();

    t.command()
        .args(["environments", "switch", "testing"])
        .assert()
        .success();
    t.command().args(["config", "init"]).assert().success();
    t.command()
        .args(["config", "sync", "--skip-reload"])
        .assert()
        .success();
    assert!(testing_base.join("state/mail/virtual_mailboxes").exists());

    t.command()
        .args(["environments", "switch", "development"])
        .assert()
        .success();

    // A→B→A: the development projections are byte-identical.
    assert_eq!(t.read("state/mail/virtual_mailboxes"), before);

    // Guard rails: the current environment cannot be removed.
    t.command()
        .args(["--json", "environments", "remove", "development"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("ENV_CURRENT_REMOVE"));

    t.command()
        .args(["environments", "switch", "missing"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn json_error_documents_carry_kind_and_context() {
    let t = TestContext::new();
    t.init();

    let output = t
        .command()
        .args(["--json", "environments", "switch", "missing"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    let doc: serde_json::Value =
        serde_json::from_slice(&output.stderr).expect("stderr is a JSON document");
    assert_eq!(doc["kind"], "ENV_NOT_FOUND");
    assert_eq!(doc["context"]["name"], "missing");
}

#[test]
fn dry_run_sync_reports_without_writing() {
    let t = TestContext::new();
    t.init();

    t.command()
        .args(["config", "sync", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("create"));

    assert!(!Path::exists(&t.dev_base().join("state/mail/virtual_mailboxes")));
}
