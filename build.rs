//! Build timestamp and target triple for the `racksync starting` log line.

use vergen::{BuildBuilder, CargoBuilder, Emitter};

fn main() {
    let mut emitter = Emitter::default();

    match BuildBuilder::default().build_timestamp(true).build() {
        Ok(build) => {
            if let Err(e) = emitter.add_instructions(&build) {
                println!("cargo:warning=build timestamp unavailable: {e}");
            }
        }
        Err(e) => println!("cargo:warning=build timestamp unavailable: {e}"),
    }
    match CargoBuilder::default().target_triple(true).build() {
        Ok(cargo) => {
            if let Err(e) = emitter.add_instructions(&cargo) {
                println!("cargo:warning=target triple unavailable: {e}");
            }
        }
        Err(e) => println!("cargo:warning=target triple unavailable: {e}"),
    }

    if let Err(e) = emitter.emit() {
        println!("cargo:warning=vergen emit skipped: {e}");
    }
}
