const MSG: &str = r#"
Kialo LTI 1.3 Platform
======================
This project contains three binaries:
1. Platform: the LTI platform web service (launch, auth, deep linking, grading)
2. Keygen: provisions the platform signing keychain
3. Tool: a client script that drives a full launch against a running platform

To provision the signing key:
  cargo run --bin keygen

To run the platform web server:
  cargo run --bin platform

To run the tool client script:
  cargo run --bin tool

See DESIGN.md for more details.
"#;

fn main() {
    println!("{}", MSG);
}
