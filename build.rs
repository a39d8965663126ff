use std::process::Command;

fn main() {
    // Base version from Cargo, suffixed with the short git sha when one is
    // available (GIT_SHA overrides for CI builds without a checkout)
    let base = env!("CARGO_PKG_VERSION");

    let mut sha = std::env::var("GIT_SHA").ok().filter(|s| !s.is_empty());
    if sha.is_none()
        && let Ok(output) = Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
        && output.status.success()
    {
        let s = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !s.is_empty() {
            sha = Some(s);
        }
    }

    let version = match sha {
        Some(s) => format!("{}+{}", base, s),
        None => base.to_string(),
    };
    println!("cargo:rustc-env=APP_VERSION={}", version);

    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
