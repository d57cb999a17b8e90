//! Progress output for a person watching the terminal.

use supplant_common::substitute::Progress;

/// Prints progress to standard output.
pub struct Console;

impl Progress for Console {
    fn header(&mut self, message: &str) {
        println!("=> {}", message);
    }

    fn item(&mut self, message: &str) {
        println!(" - {}", message);
    }

    fn info(&mut self, message: &str) {
        println!("{}", message);
    }

    fn error(&mut self, message: &str) {
        eprintln!("ERROR {}", message);
    }
}
