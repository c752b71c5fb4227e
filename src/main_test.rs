use super::*;

#[test]
fn protocol_errors_print_their_code() {
    let err = CliError::from(ProtocolError::Rejected { message: "bad password".into() });
    assert_eq!(err.to_string(), "[E_REJECTED] bad password");

    let err = CliError::from(ProtocolError::Validation("message cannot be empty".into()));
    assert_eq!(err.to_string(), "[E_VALIDATION] message cannot be empty");
}

#[test]
fn json_errors_convert_for_question_mark() {
    let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    assert!(matches!(CliError::from(source), CliError::Json(_)));
}

#[test]
fn cli_parses_send_with_overrides() {
    let cli = Cli::try_parse_from(["messenger", "--url", "ws://h:1", "send", "5", "hi"]).unwrap();
    assert_eq!(cli.url.as_deref(), Some("ws://h:1"));
    assert!(matches!(cli.command, Command::Send { conversation_id: 5, ref text } if text == "hi"));
}
