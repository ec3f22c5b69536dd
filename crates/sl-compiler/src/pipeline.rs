pub fn compile_project_scripts_from_xml_map(
    xml_by_path: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ScriptIr>, ScriptLangError> {
    Ok(compile_project_bundle_from_xml_map(xml_by_path)?.scripts)
}

pub fn compile_project_bundle_from_xml_map(
    xml_by_path: &BTreeMap<String, String>,
) -> Result<CompileProjectBundleResult, ScriptLangError> {
    debug!(file_count = xml_by_path.len(), "compiling project from xml map");
    let sources = parse_sources(xml_by_path)?;
    validate_include_graph(&sources)?;

    let main_files = find_main_script_files(&sources);
    let main_file = match main_files.as_slice() {
        [] => {
            warn!("compile: no main script root found among sources");
            return Err(ScriptLangError::new(
                "XML_INCLUDE_NO_MAIN",
                "No <script name=\"main\"> root was found among the provided sources.",
            ));
        }
        [single] => single.clone(),
        _ => {
            warn!(candidates = %main_files.join(", "), "compile: multiple main script roots found");
            return Err(ScriptLangError::new(
                "API_DUPLICATE_SCRIPT_NAME",
                format!(
                    "Multiple files declare a <script name=\"main\"> root: {}.",
                    main_files.join(", ")
                ),
            ));
        }
    };

    let reachable_from_main = collect_reachable_files(&main_file, &sources);

    let defs_by_path = parse_defs_files(&sources)?;
    let global_json = collect_global_json(&sources)?;
    let all_json_symbols = global_json.keys().cloned().collect::<BTreeSet<_>>();

    let mut scripts = BTreeMap::new();

    for (file_path, source) in &sources {
        if !matches!(source.kind, SourceKind::ScriptXml) {
            continue;
        }
        if !reachable_from_main.contains(file_path) {
            continue;
        }

        let script_root = source
            .xml_root
            .as_ref()
            .expect("script/defs sources should always carry parsed xml root");

        if script_root.name != "script" {
            return Err(ScriptLangError::with_span(
                "XML_ROOT_INVALID",
                format!(
                    "Expected <script> root in file \"{}\", got <{}>.",
                    file_path, script_root.name
                ),
                script_root.location.clone(),
            ));
        }

        let reachable = collect_reachable_files(file_path, &sources);
        let (visible_types, visible_functions) = resolve_visible_defs(&reachable, &defs_by_path)?;
        let visible_json_symbols = collect_visible_json_symbols(&reachable, &sources)?;

        let ir = compile_script(
            file_path,
            script_root,
            &visible_types,
            &visible_functions,
            &visible_json_symbols,
            &all_json_symbols,
        )?;

        if scripts.contains_key(&ir.script_name) {
            warn!(script = %ir.script_name, "compile: duplicate script name");
            return Err(ScriptLangError::with_span(
                "API_DUPLICATE_SCRIPT_NAME",
                format!("Duplicate script name \"{}\".", ir.script_name),
                script_root.location.clone(),
            ));
        }

        debug!(script = %ir.script_name, file = %file_path, "compiled script");
        scripts.insert(ir.script_name.clone(), ir);
    }

    debug!(script_count = scripts.len(), "project compilation complete");
    Ok(CompileProjectBundleResult {
        scripts,
        global_json,
    })
}

fn find_main_script_files(sources: &BTreeMap<String, SourceFile>) -> Vec<String> {
    let mut main_files = sources
        .iter()
        .filter(|(_, source)| matches!(source.kind, SourceKind::ScriptXml))
        .filter_map(|(file_path, source)| {
            let root = source.xml_root.as_ref()?;
            let is_main = root.name == "script" && root.attributes.get("name").map(String::as_str) == Some("main");
            is_main.then(|| file_path.clone())
        })
        .collect::<Vec<_>>();
    main_files.sort();
    main_files
}

