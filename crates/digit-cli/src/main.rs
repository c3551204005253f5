use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    digit_cli::cli()
}
