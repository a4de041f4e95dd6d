use clap::Parser;

use authd::server::{self, Options};

fn main() {
    std::process::exit(server::run(Options::parse()))
}
