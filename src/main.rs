use std::process;

fn main() {
    if let Err(err) = tablesink::app::run() {
        eprintln!("fatal: {err:#}");
        process::exit(1);
    }
}
