//! Version information.

pub fn run() -> anyhow::Result<()> {
    println!("vigil {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
