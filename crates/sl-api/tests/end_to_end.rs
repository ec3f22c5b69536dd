use std::collections::BTreeMap;

use sl_api::{create_engine_from_xml, CreateEngineFromXmlOptions};
use sl_core::EngineOutput;

fn xml(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(path, text)| ((*path).to_string(), (*text).to_string()))
        .collect()
}

fn start_engine(
    files: BTreeMap<String, String>,
    seed: Option<u32>,
) -> sl_runtime::ScriptLangEngine {
    create_engine_from_xml(CreateEngineFromXmlOptions {
        scripts_xml: files,
        entry_args: None,
        host_functions: None,
        random_seed: seed,
        compiler_version: None,
    })
    .expect("engine should start")
}

fn expect_text(output: EngineOutput) -> String {
    match output {
        EngineOutput::Text { text } => text,
        other => panic!("expected text output, got {:?}", other),
    }
}

#[test]
fn text_then_choice_then_text() {
    let mut engine = start_engine(
        xml(&[(
            "main.script.xml",
            r#"
<script name="main">
  <var name="hp" type="number">10</var>
  <text>HP ${hp}</text>
  <choice text="Pick">
    <option text="Heal"><code>hp = hp + 5;</code></option>
  </choice>
  <text>After ${hp}</text>
</script>
"#,
        )]),
        Some(1),
    );

    assert_eq!(expect_text(engine.next().expect("next")), "HP 10");

    let choices = engine.next().expect("next");
    match choices {
        EngineOutput::Choices { items, prompt_text } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].index, 0);
            assert_eq!(items[0].text, "Heal");
            assert_eq!(prompt_text.as_deref(), Some("Pick"));
        }
        other => panic!("expected choices output, got {:?}", other),
    }

    engine.choose(0).expect("choose");
    assert_eq!(expect_text(engine.next().expect("next")), "After 15");
    assert!(matches!(engine.next().expect("next"), EngineOutput::End));
}

#[test]
fn random_is_deterministic_for_seed_42() {
    let mut engine = start_engine(
        xml(&[(
            "main.script.xml",
            r#"
<script name="main">
  <text>${random(10)}</text>
  <text>${random(10)}</text>
  <text>${random(10)}</text>
</script>
"#,
        )]),
        Some(42),
    );

    for expected in ["6", "0", "4"] {
        assert_eq!(expect_text(engine.next().expect("next")), expected);
    }
}

#[test]
fn ref_writeback_updates_caller_variable() {
    let mut engine = start_engine(
        xml(&[(
            "main.script.xml",
            r#"
<script name="main">
  <!-- include: buff.script.xml -->
  <var name="hp" type="number">1</var>
  <call script="buff" args="3,ref:hp"/>
  <text>HP=${hp}</text>
</script>
"#,
        ),
        (
            "buff.script.xml",
            r#"<script name="buff" args="number:amount,ref:number:target"><code>target = target + amount;</code></script>"#,
        )]),
        Some(1),
    );

    assert_eq!(expect_text(engine.next().expect("next")), "HP=4");
}

#[test]
fn tail_transfer_with_ref_runs_target_script() {
    let mut engine = start_engine(
        xml(&[
            (
                "main.script.xml",
                r#"
<script name="main">
  <!-- include: mid.script.xml -->
  <var name="hp" type="number">1</var>
  <call script="mid" args="ref:hp"/>
  <text>hp=${hp}</text>
</script>
"#,
            ),
            (
                "mid.script.xml",
                r#"
<script name="mid" args="ref:number:x">
  <!-- include: tail.script.xml -->
  <code>x = x + 1;</code>
  <return script="tail" args="x+1"/>
</script>
"#,
            ),
            (
                "tail.script.xml",
                r#"<script name="tail" args="number:y"><text>tail=${y}</text></script>"#,
            ),
        ]),
        Some(1),
    );

    assert_eq!(expect_text(engine.next().expect("next")), "tail=3");
    assert_eq!(expect_text(engine.next().expect("next")), "hp=2");
}

#[test]
fn once_option_hides_after_use_and_exposes_fall_over() {
    let mut engine = start_engine(
        xml(&[(
            "main.script.xml",
            r#"
<script name="main">
  <choice text="Pick">
    <option text="Use key" once="true"><text>key</text><continue/></option>
    <option text="Leave" fall_over="true"><text>leave</text></option>
  </choice>
</script>
"#,
        )]),
        Some(1),
    );

    let first = engine.next().expect("next");
    match first {
        EngineOutput::Choices { items, .. } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].text, "Use key");
        }
        other => panic!("expected choices output, got {:?}", other),
    }
    engine.choose(0).expect("choose");
    assert_eq!(expect_text(engine.next().expect("next")), "key");

    let second = engine.next().expect("next");
    match second {
        EngineOutput::Choices { items, .. } => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].text, "Leave");
        }
        other => panic!("expected choices output, got {:?}", other),
    }
}

#[test]
fn snapshot_mid_choice_resumes_with_equivalent_boundary() {
    let source = xml(&[(
        "main.script.xml",
        r#"
<script name="main">
  <var name="hp" type="number">10</var>
  <text>HP ${hp}</text>
  <choice text="Pick">
    <option text="Heal"><code>hp = hp + 5;</code></option>
  </choice>
  <text>After ${hp}</text>
</script>
"#,
    )]);

    let mut engine = start_engine(source.clone(), Some(1));
    assert_eq!(expect_text(engine.next().expect("next")), "HP 10");
    let original_choices = engine.next().expect("next");
    let snapshot = engine.snapshot().expect("snapshot");

    let mut resumed = sl_runtime::ScriptLangEngine::new(sl_runtime::ScriptLangEngineOptions {
        scripts: sl_api::compile_scripts_from_xml_map(&source).expect("compile"),
        global_json: BTreeMap::new(),
        host_functions: None,
        random_seed: None,
        compiler_version: None,
    })
    .expect("engine should build");
    resumed.resume(snapshot).expect("resume");

    let resumed_choices = resumed.next().expect("next");
    assert_eq!(resumed_choices, original_choices);

    resumed.choose(0).expect("choose");
    assert_eq!(expect_text(resumed.next().expect("next")), "After 15");
}
