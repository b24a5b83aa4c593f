// Tests for the line parser and line provenance

use krusty_loader::gcode::{Line, LineOrigin, SyntaxClass, parse_line};

#[test]
fn test_classic_and_extended_examples() {
    let cmd = parse_line("G1 X10 Y20.5 ; move").unwrap();
    assert_eq!(cmd.name(), "G1");
    assert_eq!(cmd.get("X"), Some("10"));
    assert_eq!(cmd.get("Y"), Some("20.5"));
    assert_eq!(cmd.params().len(), 2);

    let cmd = parse_line("SET_FAN SPEED=0.5").unwrap();
    assert_eq!(cmd.name(), "SET_FAN");
    assert_eq!(cmd.syntax(), SyntaxClass::Extended);
    assert_eq!(cmd.get("SPEED"), Some("0.5"));

    assert!(parse_line("; only a comment").is_none());
}

#[test]
fn test_parse_is_idempotent_over_corpus() {
    let corpus = [
        "G28",
        "g1 x1.5 y-2 e0.02 f1800",
        "M117 Printing layer 3",
        "N10 M104 S215*45",
        "SET_PRESSURE_ADVANCE ADVANCE=0.04 EXTRUDER=\"extruder 1\"",
        "RESPOND MSG=done",
        "   ",
        ";comment",
        "T1",
        "G92.1",
    ];
    for raw in corpus {
        assert_eq!(parse_line(raw), parse_line(raw), "line {:?}", raw);
    }
}

#[test]
fn test_raw_params_preserve_case() {
    let cmd = parse_line("M117 Hello World").unwrap();
    assert_eq!(cmd.raw_params(), "Hello World");
    assert_eq!(cmd.to_string(), "M117 Hello World");
}

#[test]
fn test_line_display_for_macro_origin() {
    let line = Line::new("G1 X5", LineOrigin::Macro { name: "PURGE".into(), number: 2 }, None);
    assert_eq!(line.to_string(), "  - PURGE:2: G1 X5");
    assert_eq!(line.name(), Some("G1"));
}
