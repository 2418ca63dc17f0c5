use clap::Parser;

fn main() {
    let args = fab_tcp::PutArgs::parse();
    std::process::exit(fab_tcp::run_put(args));
}
