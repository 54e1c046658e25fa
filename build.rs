/// Set, when one of the logging backends was selected.
const LOGGING_ENABLED: &str = "logging_enabled";

fn main() {
    let log = cfg!(feature = "log");
    let defmt = cfg!(feature = "defmt");
    if log && defmt {
        panic!("You must select at most one logging backend.");
    }
    println!("cargo:rustc-check-cfg=cfg({LOGGING_ENABLED})");
    if log || defmt {
        println!("cargo:rustc-cfg={LOGGING_ENABLED}");
    }
}
