use crate::ir::{
    Block, BlockInput, Color, Costume, DataRef, List, ProcedureArgument, ProcedureMutation,
    Project, RotationStyle, ScalarValue, Script, Sound, SpriteState, Target, TargetKind, Variable,
    VariableMode,
};
use crate::opcodes::{field_kind, field_types, is_statement_slot, FieldKind, InputStatus};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Costume,
    Sound,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Costume => "costume",
            AssetKind::Sound => "sound",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub kind: AssetKind,
    pub name: String,
    pub md5: String,
    pub ext: String,
    pub sprite_name: String,
}

impl AssetRequest {
    pub fn md5ext(&self) -> String {
        format!("{}.{}", self.md5, self.ext)
    }
}

/// Supplies the bytes of costumes and sounds while a project is decoded.
///
/// All fetches of one target run concurrently on the tokio runtime, so the
/// decoder must be driven from inside one.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, request: AssetRequest) -> Result<Vec<u8>>;
}

pub async fn decode_project(json: &Value, fetcher: Arc<dyn AssetFetcher>) -> Result<Project> {
    let targets = json
        .get("targets")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid project.json: missing 'targets' array."))?;
    if let Some(semver) = json
        .get("meta")
        .and_then(|m| m.get("semver"))
        .and_then(Value::as_str)
    {
        if !semver.starts_with('3') {
            warn!(semver, "project.json does not declare a 3.x schema");
        }
    }
    let monitors = MonitorIndex::new(json.get("monitors"));

    let stage_json = targets
        .iter()
        .find(|t| is_stage_json(t))
        .ok_or_else(|| anyhow!("Invalid project.json: no stage target."))?;
    let stage = decode_target(stage_json, &monitors, &fetcher).await?;

    let mut sprites = Vec::new();
    for sprite_json in targets.iter().filter(|t| !is_stage_json(t)) {
        sprites.push(decode_target(sprite_json, &monitors, &fetcher).await?);
    }

    let mut project = Project::new(stage, sprites);
    project.tempo = number_or(stage_json, "tempo", 60.0);
    project.video_on = stage_json.get("videoState").and_then(Value::as_str) == Some("on");
    project.video_transparency = number_or(stage_json, "videoTransparency", 50.0);

    prune_unreferenced_data(&mut project);
    info!(sprites = project.sprites.len(), "decoded project");
    Ok(project)
}

/// Drops variables and lists that are neither shown in a monitor nor read by any block.
///
/// Stage data is global, so it is checked against the blocks of every target;
/// sprite data only against the sprite's own blocks.
pub fn prune_unreferenced_data(project: &mut Project) {
    let mut global_refs = HashSet::new();
    for target in project.targets() {
        target.collect_data_references(&mut global_refs);
    }
    prune_target(&mut project.stage, &global_refs);
    for sprite in &mut project.sprites {
        let mut local_refs = HashSet::new();
        sprite.collect_data_references(&mut local_refs);
        prune_target(sprite, &local_refs);
    }
}

fn prune_target(target: &mut Target, used: &HashSet<String>) {
    let owner = &target.name;
    target.variables.retain(|v| {
        let keep = v.visible || used.contains(&v.id);
        if !keep {
            debug!(owner = %owner, variable = %v.name, "pruning unreferenced variable");
        }
        keep
    });
    target.lists.retain(|l| {
        let keep = l.visible || used.contains(&l.id);
        if !keep {
            debug!(owner = %owner, list = %l.name, "pruning unreferenced list");
        }
        keep
    });
}

fn is_stage_json(target: &Value) -> bool {
    target
        .get("isStage")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

async fn decode_target(
    target: &Value,
    monitors: &MonitorIndex<'_>,
    fetcher: &Arc<dyn AssetFetcher>,
) -> Result<Target> {
    let name = target
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Target missing 'name'."))?
        .to_string();

    let (costumes, sounds) = fetch_assets(target, &name, fetcher).await?;

    let empty = Map::new();
    let blocks = target
        .get("blocks")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let decoder = ScriptDecoder::new(blocks);
    let mut scripts = Vec::new();
    for (id, block) in blocks {
        if !flag(block, "topLevel") || flag(block, "shadow") {
            continue;
        }
        let chain = decoder
            .chain(id)
            .with_context(|| format!("Failed to decode script '{}' of '{}'.", id, name))?;
        scripts.push(Script::new(
            number_or(block, "x", 0.0),
            number_or(block, "y", 0.0),
            chain,
        ));
    }

    let kind = if is_stage_json(target) {
        TargetKind::Stage
    } else {
        TargetKind::Sprite(SpriteState {
            x: number_or(target, "x", 0.0),
            y: number_or(target, "y", 0.0),
            size: number_or(target, "size", 100.0),
            direction: number_or(target, "direction", 90.0),
            rotation_style: RotationStyle::from_sb3(
                target
                    .get("rotationStyle")
                    .and_then(Value::as_str)
                    .unwrap_or("all around"),
            ),
            is_draggable: flag(target, "draggable"),
            visible: target
                .get("visible")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        })
    };

    let mut out = Target::new(name, kind);
    out.scripts = scripts;
    out.costumes = costumes;
    out.sounds = sounds;
    out.variables = decode_variables(target, &out.name, monitors);
    out.lists = decode_lists(target, &out.name, monitors);
    out.costume_number = target
        .get("currentCostume")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    out.volume = number_or(target, "volume", 100.0);
    out.layer_order = target
        .get("layerOrder")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    debug!(
        owner = %out.name,
        scripts = out.scripts.len(),
        costumes = out.costumes.len(),
        sounds = out.sounds.len(),
        "decoded target"
    );
    Ok(out)
}

async fn fetch_assets(
    target: &Value,
    owner: &str,
    fetcher: &Arc<dyn AssetFetcher>,
) -> Result<(Vec<Costume>, Vec<Sound>)> {
    let costume_specs = array_or_empty(target.get("costumes"));
    let sound_specs = array_or_empty(target.get("sounds"));

    let mut requests = Vec::with_capacity(costume_specs.len() + sound_specs.len());
    for spec in costume_specs {
        requests.push(asset_request(AssetKind::Costume, spec, owner)?);
    }
    for spec in sound_specs {
        requests.push(asset_request(AssetKind::Sound, spec, owner)?);
    }

    // Dropping the set on an early return aborts the fetches still in flight.
    let mut tasks = JoinSet::new();
    for (index, request) in requests.iter().cloned().enumerate() {
        let fetcher = Arc::clone(fetcher);
        tasks.spawn(async move { (index, fetcher.fetch(request).await) });
    }
    let mut fetched: Vec<Option<Vec<u8>>> = vec![None; requests.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) =
            joined.with_context(|| format!("Asset fetch task for '{}' did not complete.", owner))?;
        let request = &requests[index];
        let bytes = result.with_context(|| {
            format!(
                "Failed to fetch {} '{}' ({}) for '{}'.",
                request.kind.as_str(),
                request.name,
                request.md5ext(),
                owner
            )
        })?;
        fetched[index] = Some(bytes);
    }

    let mut fetched = fetched.into_iter().map(Option::unwrap_or_default);
    let costumes = costume_specs
        .iter()
        .zip(&mut fetched)
        .map(|(spec, asset)| decode_costume(spec, asset))
        .collect();
    let sounds = sound_specs
        .iter()
        .zip(&mut fetched)
        .map(|(spec, asset)| decode_sound(spec, asset))
        .collect();
    Ok((costumes, sounds))
}

fn asset_request(kind: AssetKind, spec: &Value, owner: &str) -> Result<AssetRequest> {
    let name = text_or_empty(spec.get("name"));
    let md5 = spec
        .get("assetId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("{} '{}' of '{}' missing assetId.", kind.as_str(), name, owner))?;
    let ext = spec
        .get("dataFormat")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            anyhow!(
                "{} '{}' of '{}' missing dataFormat.",
                kind.as_str(),
                name,
                owner
            )
        })?;
    Ok(AssetRequest {
        kind,
        name,
        md5: md5.to_string(),
        ext: ext.to_string(),
        sprite_name: owner.to_string(),
    })
}

fn decode_costume(spec: &Value, asset: Vec<u8>) -> Costume {
    Costume {
        name: text_or_empty(spec.get("name")),
        asset,
        md5: text_or_empty(spec.get("assetId")),
        ext: text_or_empty(spec.get("dataFormat")),
        bitmap_resolution: spec
            .get("bitmapResolution")
            .and_then(Value::as_f64)
            .filter(|r| *r > 0.0)
            .unwrap_or(2.0),
        center_x: spec.get("rotationCenterX").and_then(Value::as_f64),
        center_y: spec.get("rotationCenterY").and_then(Value::as_f64),
    }
}

fn decode_sound(spec: &Value, asset: Vec<u8>) -> Sound {
    Sound {
        name: text_or_empty(spec.get("name")),
        asset,
        md5: text_or_empty(spec.get("assetId")),
        ext: text_or_empty(spec.get("dataFormat")),
        sample_count: spec.get("sampleCount").and_then(Value::as_u64),
        sample_rate: spec.get("rate").and_then(Value::as_u64),
    }
}

struct MonitorIndex<'a> {
    by_id: HashMap<&'a str, &'a Value>,
}

#[derive(Debug, Clone)]
struct Monitor {
    visible: bool,
    mode: String,
    x: f64,
    y: f64,
    width: Option<f64>,
    height: Option<f64>,
    slider_min: f64,
    slider_max: f64,
    is_discrete: bool,
}

impl Monitor {
    fn synthesized(mode: &str) -> Self {
        Self {
            visible: false,
            mode: mode.to_string(),
            x: 0.0,
            y: 0.0,
            width: None,
            height: None,
            slider_min: 0.0,
            slider_max: 100.0,
            is_discrete: true,
        }
    }

    fn from_json(value: &Value, default_mode: &str) -> Self {
        let defaults = Self::synthesized(default_mode);
        Self {
            visible: value
                .get("visible")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.visible),
            mode: value
                .get("mode")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or(defaults.mode),
            x: number_or(value, "x", defaults.x),
            y: number_or(value, "y", defaults.y),
            width: value
                .get("width")
                .and_then(Value::as_f64)
                .filter(|w| *w != 0.0),
            height: value
                .get("height")
                .and_then(Value::as_f64)
                .filter(|h| *h != 0.0),
            slider_min: number_or(value, "sliderMin", defaults.slider_min),
            slider_max: number_or(value, "sliderMax", defaults.slider_max),
            is_discrete: value
                .get("isDiscrete")
                .and_then(Value::as_bool)
                .unwrap_or(defaults.is_discrete),
        }
    }
}

impl<'a> MonitorIndex<'a> {
    fn new(monitors: Option<&'a Value>) -> Self {
        let mut by_id = HashMap::new();
        for monitor in array_or_empty(monitors) {
            if let Some(id) = monitor.get("id").and_then(Value::as_str) {
                by_id.insert(id, monitor);
            }
        }
        Self { by_id }
    }

    fn monitor(&self, id: &str, owner: &str, default_mode: &str) -> Monitor {
        match self.by_id.get(id) {
            Some(value) => Monitor::from_json(value, default_mode),
            None => {
                debug!(owner = %owner, id, "no monitor record, using defaults");
                Monitor::synthesized(default_mode)
            }
        }
    }
}

fn decode_variables(target: &Value, owner: &str, monitors: &MonitorIndex<'_>) -> Vec<Variable> {
    let Some(decls) = target.get("variables").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (id, decl) in decls {
        let Some(parts) = decl.as_array() else {
            debug!(owner = %owner, id = %id, "skipping malformed variable declaration");
            continue;
        };
        let name = text_or_empty(parts.first());
        let value = parts
            .get(1)
            .map(ScalarValue::from_json)
            .unwrap_or(ScalarValue::Number(0.0));
        let monitor = monitors.monitor(id, owner, "default");
        let mut variable = Variable::new(id.clone(), name, value);
        variable.cloud = parts.get(2).and_then(Value::as_bool).unwrap_or(false);
        variable.visible = monitor.visible;
        variable.mode = VariableMode::parse(&monitor.mode);
        variable.x = monitor.x;
        variable.y = monitor.y;
        variable.slider_min = monitor.slider_min;
        variable.slider_max = monitor.slider_max;
        variable.is_discrete = monitor.is_discrete;
        out.push(variable);
    }
    out
}

fn decode_lists(target: &Value, owner: &str, monitors: &MonitorIndex<'_>) -> Vec<List> {
    let Some(decls) = target.get("lists").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (id, decl) in decls {
        let Some(parts) = decl.as_array() else {
            debug!(owner = %owner, id = %id, "skipping malformed list declaration");
            continue;
        };
        let name = text_or_empty(parts.first());
        let contents = array_or_empty(parts.get(1))
            .iter()
            .map(ScalarValue::from_json)
            .collect();
        let monitor = monitors.monitor(id, owner, "list");
        let mut list = List::new(id.clone(), name, contents);
        list.visible = monitor.visible;
        list.x = monitor.x;
        list.y = monitor.y;
        list.width = monitor.width;
        list.height = monitor.height;
        out.push(list);
    }
    out
}

/// Rebuilds nested scripts from one target's flat block table.
struct ScriptDecoder<'a> {
    blocks: &'a Map<String, Value>,
    active: RefCell<HashSet<String>>,
}

impl<'a> ScriptDecoder<'a> {
    fn new(blocks: &'a Map<String, Value>) -> Self {
        Self {
            blocks,
            active: RefCell::new(HashSet::new()),
        }
    }

    fn record(&self, id: &str) -> Result<&'a Value> {
        self.blocks
            .get(id)
            .ok_or_else(|| anyhow!("Missing block '{}'.", id))
    }

    fn chain(&self, start: &str) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(start.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                warn!(block = %id, "cyclic block chain, cutting at repeated block");
                break;
            }
            let record = self.record(&id)?;
            out.push(self.block(&id, record)?);
            current = record
                .get("next")
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }
        Ok(out)
    }

    fn block(&self, id: &str, record: &'a Value) -> Result<Block> {
        if !self.active.borrow_mut().insert(id.to_string()) {
            bail!("Block '{}' is nested inside itself.", id);
        }
        let decoded = self.decode_block(id, record);
        self.active.borrow_mut().remove(id);
        decoded
    }

    fn decode_block(&self, id: &str, record: &'a Value) -> Result<Block> {
        let opcode = opcode_of(id, record)?;
        let mut block = Block::new(id, opcode);
        self.decode_inputs(opcode, id, record, &mut block.inputs, &mut block.mutation)?;
        block.inputs.extend(decode_fields(record.get("fields"), opcode));
        if opcode == "procedures_call" {
            reindex_call_arguments(&mut block, record);
        }
        Ok(block)
    }

    fn decode_inputs(
        &self,
        owner_opcode: &str,
        owner_id: &str,
        record: &'a Value,
        out: &mut BTreeMap<String, BlockInput>,
        mutation: &mut Option<ProcedureMutation>,
    ) -> Result<()> {
        let Some(inputs) = record.get("inputs").and_then(Value::as_object) else {
            return Ok(());
        };
        for (slot, input) in inputs {
            let Some(value) = input.as_array().and_then(|parts| parts.get(1)) else {
                continue;
            };
            match value {
                Value::String(child_id) => {
                    self.decode_block_input(owner_opcode, slot, child_id, out, mutation)?
                }
                Value::Array(primitive) => {
                    if let Some(decoded) = decode_primitive(primitive, owner_id, slot) {
                        out.insert(slot.clone(), decoded);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn decode_block_input(
        &self,
        owner_opcode: &str,
        slot: &str,
        child_id: &str,
        out: &mut BTreeMap<String, BlockInput>,
        mutation: &mut Option<ProcedureMutation>,
    ) -> Result<()> {
        let child = self.record(child_id)?;
        let has_next = child.get("next").and_then(Value::as_str).is_some();
        if flag(child, "shadow") && !has_next {
            let child_opcode = opcode_of(child_id, child)?;
            if child_opcode == "procedures_prototype" {
                *mutation = Some(decode_prototype(child_id, child)?);
                return Ok(());
            }

            let mut shadow_inputs = BTreeMap::new();
            let mut shadow_mutation = None;
            self.decode_inputs(
                child_opcode,
                child_id,
                child,
                &mut shadow_inputs,
                &mut shadow_mutation,
            )?;
            let mut shadow_fields = decode_fields(child.get("fields"), child_opcode);
            if child_opcode == "pen_menu_colorParam" {
                if let Some(param) = shadow_fields.remove("colorParam") {
                    out.insert("COLOR_PARAM".to_string(), param);
                }
            } else {
                out.extend(shadow_inputs);
                out.extend(shadow_fields);
            }
            return Ok(());
        }

        let mut chain = self.chain(child_id)?;
        let input = if is_statement_slot(owner_opcode, slot) || chain.len() > 1 {
            BlockInput::Blocks(chain)
        } else {
            match chain.pop() {
                Some(block) => BlockInput::Block(Box::new(block)),
                None => return Ok(()),
            }
        };
        out.insert(slot.to_string(), input);
        Ok(())
    }
}

fn decode_primitive(primitive: &[Value], owner_id: &str, slot: &str) -> Option<BlockInput> {
    let code = primitive.first().and_then(Value::as_i64);
    let Some(status) = code.and_then(InputStatus::from_code) else {
        debug!(block = %owner_id, slot, ?code, "skipping unknown primitive tag");
        return None;
    };
    let payload = primitive.get(1);
    let reference = || DataRef::new(text_or_empty(primitive.get(2)), text_or_empty(payload));
    let input = match status {
        InputStatus::MathNumber
        | InputStatus::PositiveNumber
        | InputStatus::WholeNumber
        | InputStatus::IntegerNumber => BlockInput::Number(coerce_scalar(payload)),
        InputStatus::AngleNumber => {
            let angle = match coerce_scalar(payload) {
                ScalarValue::Number(n) => n,
                _ => 0.0,
            };
            BlockInput::Angle(angle)
        }
        InputStatus::ColorPicker => {
            let text = text_or_empty(payload);
            match Color::from_hex(&text) {
                Some(color) => BlockInput::Color(color),
                None => {
                    debug!(block = %owner_id, slot, color = %text, "skipping malformed color");
                    return None;
                }
            }
        }
        InputStatus::Text => BlockInput::String(text_or_empty(payload)),
        InputStatus::Broadcast => BlockInput::Broadcast(reference()),
        InputStatus::Variable => BlockInput::Block(Box::new(
            Block::new(format!("{}-{}", owner_id, slot), "data_variable")
                .with_input("VARIABLE", BlockInput::Variable(reference())),
        )),
        InputStatus::List => BlockInput::Block(Box::new(
            Block::new(format!("{}-{}", owner_id, slot), "data_listcontents")
                .with_input("LIST", BlockInput::List(reference())),
        )),
        InputStatus::SameBlockShadow | InputStatus::BlockNoShadow | InputStatus::DiffBlockShadow => {
            debug!(block = %owner_id, slot, "skipping nested input status in primitive position");
            return None;
        }
    };
    Some(input)
}

fn decode_fields(fields: Option<&Value>, opcode: &str) -> BTreeMap<String, BlockInput> {
    let mut out = BTreeMap::new();
    let Some(fields) = fields.and_then(Value::as_object) else {
        return out;
    };
    if field_types(opcode).is_none() {
        if !fields.is_empty() {
            debug!(opcode, "dropping fields of opcode without a field map");
        }
        return out;
    }
    for (name, parts) in fields {
        let parts = array_or_empty(Some(parts));
        let value = text_or_empty(parts.first());
        let reference = || DataRef::new(text_or_empty(parts.get(1)), value.clone());
        let input = match field_kind(opcode, name) {
            Some(FieldKind::Variable) => BlockInput::Variable(reference()),
            Some(FieldKind::List) => BlockInput::List(reference()),
            Some(FieldKind::Broadcast) => BlockInput::Broadcast(reference()),
            Some(FieldKind::Number) => BlockInput::Number(coerce_scalar(parts.first())),
            Some(FieldKind::Menu(kind)) => BlockInput::Menu {
                kind,
                value: value.clone(),
            },
            Some(FieldKind::String) | None => BlockInput::String(value.clone()),
        };
        out.insert(name.clone(), input);
    }
    out
}

fn decode_prototype(id: &str, record: &Value) -> Result<ProcedureMutation> {
    let mutation = record
        .get("mutation")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("Procedure prototype '{}' missing mutation.", id))?;
    let proccode = mutation
        .get("proccode")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Procedure prototype '{}' missing proccode.", id))?;
    let names = encoded_list(mutation.get("argumentnames"));
    let defaults = encoded_list(mutation.get("argumentdefaults"));
    let argument_ids = encoded_list(mutation.get("argumentids"))
        .iter()
        .map(|v| text_or_empty(Some(v)))
        .collect();
    Ok(ProcedureMutation {
        proccode: proccode.to_string(),
        argument_ids,
        arguments: procedure_arguments(proccode, names, defaults)?,
        warp: mutation_flag(mutation.get("warp")),
    })
}

fn procedure_arguments(
    proccode: &str,
    names: Vec<Value>,
    defaults: Vec<Value>,
) -> Result<Vec<ProcedureArgument>> {
    let mut names = names.into_iter();
    let mut defaults = defaults.into_iter();
    let arguments = tokenize_proccode(proccode)?
        .into_iter()
        .map(|token| match token {
            ProccodeToken::Label(text) => ProcedureArgument::Label { text },
            ProccodeToken::Placeholder('b') => ProcedureArgument::Boolean {
                name: text_or_empty(names.next().as_ref()),
                default: mutation_flag(defaults.next().as_ref()),
            },
            ProccodeToken::Placeholder(_) => ProcedureArgument::NumberOrString {
                name: text_or_empty(names.next().as_ref()),
                default: coerce_scalar(defaults.next().as_ref()),
            },
        })
        .collect();
    Ok(arguments)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProccodeToken {
    Label(String),
    Placeholder(char),
}

/// Splits `"letter %n of %s"` into labels and `%n`/`%s`/`%b` placeholders.
/// A backslash-escaped marker stays part of the label text.
pub(crate) fn tokenize_proccode(proccode: &str) -> Result<Vec<ProccodeToken>> {
    let marker = Regex::new(r"\\?%[nsb]")?;
    let mut tokens = Vec::new();
    let mut label_start = 0;
    for found in marker.find_iter(proccode) {
        let text = found.as_str();
        if text.starts_with('\\') {
            continue;
        }
        push_label(&mut tokens, &proccode[label_start..found.start()]);
        if let Some(kind) = text.chars().nth(1) {
            tokens.push(ProccodeToken::Placeholder(kind));
        }
        label_start = found.end();
    }
    push_label(&mut tokens, &proccode[label_start..]);
    Ok(tokens)
}

fn push_label(tokens: &mut Vec<ProccodeToken>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        tokens.push(ProccodeToken::Label(trimmed.to_string()));
    }
}

fn reindex_call_arguments(block: &mut Block, record: &Value) {
    let mutation = record.get("mutation").and_then(Value::as_object);
    let proccode = mutation
        .and_then(|m| m.get("proccode"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if mutation.is_none() {
        warn!(block = %block.id, "procedure call without mutation");
    }
    let argument_ids = encoded_list(mutation.and_then(|m| m.get("argumentids")))
        .iter()
        .map(|v| text_or_empty(Some(v)))
        .collect::<Vec<_>>();
    let values = argument_ids
        .iter()
        .map(|arg_id| match block.inputs.remove(arg_id) {
            Some(value) => coerce_call_argument(value),
            None => {
                debug!(block = %block.id, argument = %arg_id, "unfilled procedure argument, using false");
                BlockInput::Boolean(false)
            }
        })
        .collect();
    block.inputs = BTreeMap::from([("INPUTS".to_string(), BlockInput::ProcedureInputs(values))]);
    block.mutation = Some(ProcedureMutation {
        proccode: proccode.to_string(),
        argument_ids,
        arguments: Vec::new(),
        warp: mutation_flag(mutation.and_then(|m| m.get("warp"))),
    });
}

fn coerce_call_argument(value: BlockInput) -> BlockInput {
    match value {
        BlockInput::String(text) | BlockInput::Number(ScalarValue::String(text)) => {
            match coerce_number(&text) {
                Some(n) => BlockInput::number(n),
                None => BlockInput::String(text),
            }
        }
        other => other,
    }
}

/// Numeric reading of stored text, following the schema's loose number rules
/// (`"10"`, `" 2.5 "`, `"1e3"`, `"0x1f"`, `"-Infinity"`). Blank text is not a number.
pub(crate) fn coerce_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let unsigned = trimmed.trim_start_matches(['+', '-']);
    if unsigned.len() + 1 < trimmed.len() {
        return None;
    }
    if unsigned == "Infinity" {
        return Some(if trimmed.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        });
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    if !unsigned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
    {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn coerce_scalar(value: Option<&Value>) -> ScalarValue {
    match value {
        Some(Value::Number(n)) => ScalarValue::Number(n.as_f64().unwrap_or_default()),
        Some(Value::String(s)) => match coerce_number(s) {
            Some(n) => ScalarValue::Number(n),
            None => ScalarValue::String(s.clone()),
        },
        Some(Value::Bool(b)) => ScalarValue::Boolean(*b),
        _ => ScalarValue::String(String::new()),
    }
}

/// Mutation lists are stored as JSON text (`"[\"a\",\"b\"]"`); some writers inline the array.
fn encoded_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::String(text)) => serde_json::from_str::<Vec<Value>>(text).unwrap_or_default(),
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

fn mutation_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn opcode_of<'v>(id: &str, record: &'v Value) -> Result<&'v str> {
    record
        .get("opcode")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Block '{}' missing opcode.", id))
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn number_or(value: &Value, key: &str, default: f64) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn text_or_empty(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn array_or_empty(value: Option<&Value>) -> &[Value] {
    value
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct NoAssets;

    #[async_trait]
    impl AssetFetcher for NoAssets {
        async fn fetch(&self, _request: AssetRequest) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct SlowFirstAssets;

    #[async_trait]
    impl AssetFetcher for SlowFirstAssets {
        async fn fetch(&self, request: AssetRequest) -> Result<Vec<u8>> {
            if request.name == "first" {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Ok(request.name.into_bytes())
        }
    }

    struct BrokenAssets;

    #[async_trait]
    impl AssetFetcher for BrokenAssets {
        async fn fetch(&self, request: AssetRequest) -> Result<Vec<u8>> {
            if request.kind == AssetKind::Sound {
                bail!("sound store offline");
            }
            Ok(vec![1, 2, 3])
        }
    }

    fn project_with(sprite_blocks: Value, sprite_variables: Value) -> Value {
        json!({
            "targets": [
                {
                    "isStage": true,
                    "name": "Stage",
                    "variables": {},
                    "lists": {},
                    "blocks": {},
                    "costumes": [],
                    "sounds": [],
                    "tempo": 90,
                    "videoState": "on",
                    "videoTransparency": 30
                },
                {
                    "isStage": false,
                    "name": "Sprite1",
                    "variables": sprite_variables,
                    "lists": {},
                    "blocks": sprite_blocks,
                    "costumes": [],
                    "sounds": [],
                    "x": 12,
                    "y": -4,
                    "size": 150,
                    "direction": 45,
                    "rotationStyle": "left-right",
                    "draggable": true,
                    "visible": false
                }
            ],
            "monitors": [],
            "meta": { "semver": "3.0.0" }
        })
    }

    async fn decode(json: &Value) -> Project {
        decode_project(json, Arc::new(NoAssets)).await.expect("decode")
    }

    fn top(opcode: &str) -> Value {
        json!({
            "opcode": opcode, "next": null, "parent": null, "inputs": {}, "fields": {},
            "shadow": false, "topLevel": true, "x": 0, "y": 0
        })
    }

    fn inner(opcode: &str, parent: &str) -> Value {
        json!({
            "opcode": opcode, "next": null, "parent": parent, "inputs": {}, "fields": {},
            "shadow": false, "topLevel": false
        })
    }

    #[tokio::test]
    async fn decodes_literal_number_input() {
        let blocks = json!({
            "a": {
                "opcode": "motion_movesteps",
                "inputs": { "STEPS": [1, [4, "10"]] },
                "fields": {},
                "next": null,
                "parent": null,
                "shadow": false,
                "topLevel": true,
                "x": 0,
                "y": 0
            }
        });
        let project = decode(&project_with(blocks, json!({}))).await;
        let sprite = &project.sprites[0];
        assert_eq!(sprite.scripts.len(), 1);
        let script = &sprite.scripts[0];
        assert_eq!((script.x, script.y), (0.0, 0.0));
        assert_eq!(script.blocks.len(), 1);
        assert_eq!(script.blocks[0].opcode, "motion_movesteps");
        assert_eq!(script.blocks[0].input("STEPS"), Some(&BlockInput::number(10.0)));
    }

    #[tokio::test]
    async fn reads_sprite_pose_and_project_settings() {
        let project = decode(&project_with(json!({}), json!({}))).await;
        let state = project.sprites[0].sprite_state().expect("sprite");
        assert_eq!((state.x, state.y), (12.0, -4.0));
        assert_eq!(state.size, 150.0);
        assert_eq!(state.rotation_style, RotationStyle::LeftRight);
        assert!(state.is_draggable);
        assert!(!state.visible);
        assert_eq!(project.tempo, 90.0);
        assert!(project.video_on);
        assert_eq!(project.video_transparency, 30.0);
    }

    #[tokio::test]
    async fn prunes_unreferenced_variable() {
        let project = decode(&project_with(json!({}), json!({ "var1": ["score", 0] }))).await;
        assert!(project.sprites[0].variables.is_empty());
    }

    #[tokio::test]
    async fn keeps_referenced_variable_with_default_monitor() {
        let mut set = top("data_setvariableto");
        set["fields"] = json!({ "VARIABLE": ["score", "var1"] });
        set["inputs"] = json!({ "VALUE": [1, [10, "0"]] });
        let project = decode(&project_with(
            json!({ "set": set }),
            json!({ "var1": ["score", 0] }),
        ))
        .await;
        let variable = project.sprites[0].variable("var1").expect("kept");
        assert_eq!(variable.name, "score");
        assert_eq!(variable.value, ScalarValue::Number(0.0));
        assert!(!variable.visible);
        assert_eq!(variable.mode, VariableMode::Default);
        assert_eq!((variable.x, variable.y), (0.0, 0.0));
        assert_eq!((variable.slider_min, variable.slider_max), (0.0, 100.0));
        assert!(variable.is_discrete);
    }

    #[tokio::test]
    async fn stage_variable_survives_through_sprite_reference() {
        let mut json = project_with(json!({}), json!({}));
        json["targets"][0]["variables"] = json!({ "g": ["global", 1], "unused": ["x", 2] });
        json["targets"][0]["lists"] = json!({ "shown": ["board", [1, "a"]] });
        json["monitors"] = json!([{
            "id": "shown", "mode": "list", "opcode": "data_listcontents",
            "params": { "LIST": "board" }, "spriteName": null, "value": [],
            "width": 0, "height": 120, "x": 5, "y": 6, "visible": true
        }]);
        let mut reporter = top("data_showvariable");
        reporter["fields"] = json!({ "VARIABLE": ["global", "g"] });
        json["targets"][1]["blocks"] = json!({ "r": reporter });

        let project = decode(&json).await;
        let ids = project
            .stage
            .variables
            .iter()
            .map(|v| v.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["g"]);
        let list = project.stage.list("shown").expect("visible list kept");
        assert_eq!(list.width, None);
        assert_eq!(list.height, Some(120.0));
        assert_eq!((list.x, list.y), (5.0, 6.0));
    }

    #[tokio::test]
    async fn sprite_variable_is_not_kept_alive_by_other_sprites() {
        let mut json = project_with(json!({}), json!({ "local": ["mine", 0] }));
        let mut other = json["targets"][1].clone();
        other["name"] = json!("Sprite2");
        other["variables"] = json!({});
        let mut reader = top("data_showvariable");
        reader["fields"] = json!({ "VARIABLE": ["mine", "local"] });
        other["blocks"] = json!({ "r": reader });
        json["targets"].as_array_mut().expect("targets").push(other);

        let project = decode(&json).await;
        assert!(project.sprites[0].variables.is_empty());
    }

    #[tokio::test]
    async fn inlines_color_param_shadow() {
        let mut pen = top("pen_setPenColorParamTo");
        pen["inputs"] = json!({ "COLOR": [1, "menu"], "VALUE": [1, [4, "50"]] });
        let mut menu = inner("pen_menu_colorParam", "pen");
        menu["shadow"] = json!(true);
        menu["fields"] = json!({ "colorParam": ["brightness", null] });

        let project = decode(&project_with(json!({ "pen": pen, "menu": menu }), json!({}))).await;
        let scripts = &project.sprites[0].scripts;
        assert_eq!(scripts.len(), 1);
        let block = &scripts[0].blocks[0];
        assert_eq!(
            block.input("COLOR_PARAM"),
            Some(&BlockInput::Menu {
                kind: "penColorParam",
                value: "brightness".to_string()
            })
        );
        assert!(block.input("COLOR").is_none());
        assert!(block
            .inputs
            .values()
            .all(|i| !matches!(i, BlockInput::Block(_) | BlockInput::Blocks(_))));
    }

    #[tokio::test]
    async fn inlines_menu_shadow_under_its_field_name() {
        let mut play = top("sound_play");
        play["inputs"] = json!({ "SOUND_MENU": [1, "menu"] });
        let mut menu = inner("sound_sounds_menu", "play");
        menu["shadow"] = json!(true);
        menu["fields"] = json!({ "SOUND_MENU": ["Meow", null] });

        let project = decode(&project_with(json!({ "play": play, "menu": menu }), json!({}))).await;
        let block = &project.sprites[0].scripts[0].blocks[0];
        assert_eq!(block.input("SOUND_MENU").and_then(BlockInput::text), Some("Meow"));
    }

    #[tokio::test]
    async fn substack_keeps_single_block_as_stack() {
        let mut repeat = top("control_repeat");
        repeat["inputs"] = json!({ "TIMES": [1, [6, "3"]], "SUBSTACK": [2, "body"] });
        let body = inner("motion_ifonedgebounce", "repeat");

        let mut add = inner("operator_add", "say");
        add["inputs"] = json!({ "NUM1": [1, [4, "1"]], "NUM2": [3, "x", [4, ""]] });
        let x = inner("motion_xposition", "add");
        let mut say = top("looks_say");
        say["inputs"] = json!({ "MESSAGE": [3, "add", [10, "hi"]] });
        say["y"] = json!(100);

        let project = decode(&project_with(
            json!({ "repeat": repeat, "body": body, "say": say, "add": add, "x": x }),
            json!({}),
        ))
        .await;
        let scripts = &project.sprites[0].scripts;
        assert_eq!(scripts.len(), 2);

        let repeat = scripts
            .iter()
            .find_map(|s| s.head().filter(|b| b.opcode == "control_repeat"))
            .expect("repeat script");
        match repeat.input("SUBSTACK") {
            Some(BlockInput::Blocks(blocks)) => assert_eq!(blocks.len(), 1),
            other => panic!("expected stack, got {:?}", other),
        }
        assert_eq!(repeat.input("TIMES"), Some(&BlockInput::number(3.0)));

        let say = scripts
            .iter()
            .find_map(|s| s.head().filter(|b| b.opcode == "looks_say"))
            .expect("say script");
        let Some(BlockInput::Block(add)) = say.input("MESSAGE") else {
            panic!("expected reporter");
        };
        assert_eq!(add.opcode, "operator_add");
        assert!(matches!(add.input("NUM2"), Some(BlockInput::Block(b)) if b.opcode == "motion_xposition"));
    }

    #[tokio::test]
    async fn chain_in_expression_slot_becomes_stack() {
        let mut wrapper = top("custom_wrapper");
        wrapper["inputs"] = json!({ "BODY": [2, "one"] });
        let mut one = inner("looks_show", "wrapper");
        one["next"] = json!("two");
        let two = inner("looks_hide", "one");
        let project = decode(&project_with(
            json!({ "wrapper": wrapper, "one": one, "two": two }),
            json!({}),
        ))
        .await;
        let block = &project.sprites[0].scripts[0].blocks[0];
        match block.input("BODY") {
            Some(BlockInput::Blocks(blocks)) => {
                let ops = blocks.iter().map(|b| b.opcode.as_str()).collect::<Vec<_>>();
                assert_eq!(ops, vec!["looks_show", "looks_hide"]);
            }
            other => panic!("expected stack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn variable_primitive_becomes_reporter_block() {
        let mut say = top("looks_say");
        say["inputs"] = json!({ "MESSAGE": [3, [12, "score", "var1"], [10, ""]] });
        let project = decode(&project_with(json!({ "say": say }), json!({ "var1": ["score", 3] }))).await;
        let block = &project.sprites[0].scripts[0].blocks[0];
        let Some(BlockInput::Block(reporter)) = block.input("MESSAGE") else {
            panic!("expected reporter block");
        };
        assert_eq!(reporter.opcode, "data_variable");
        assert_eq!(reporter.id, "say-MESSAGE");
        assert_eq!(
            reporter.input("VARIABLE"),
            Some(&BlockInput::Variable(DataRef::new("var1", "score")))
        );
        assert!(project.sprites[0].variable("var1").is_some());
    }

    #[tokio::test]
    async fn decodes_procedure_definition_and_call() {
        let mut definition = top("procedures_definition");
        definition["inputs"] = json!({ "custom_block": [1, "proto"] });
        definition["next"] = json!("call");
        let mut proto = inner("procedures_prototype", "def");
        proto["shadow"] = json!(true);
        proto["inputs"] = json!({ "a1": [1, "arg"] });
        proto["mutation"] = json!({
            "tagName": "mutation",
            "children": [],
            "proccode": "jump %s times %b",
            "argumentids": "[\"a1\",\"a2\"]",
            "argumentnames": "[\"height\",\"fast\"]",
            "argumentdefaults": "[\"10\",\"false\"]",
            "warp": "true"
        });
        let mut arg = inner("argument_reporter_string_number", "proto");
        arg["shadow"] = json!(true);
        arg["fields"] = json!({ "VALUE": ["height", null] });
        let mut call = inner("procedures_call", "def");
        call["inputs"] = json!({ "a1": [1, [10, "5"]] });
        call["mutation"] = json!({
            "tagName": "mutation",
            "children": [],
            "proccode": "jump %s times %b",
            "argumentids": "[\"a1\",\"a2\"]",
            "warp": "false"
        });

        let project = decode(&project_with(
            json!({ "def": definition, "proto": proto, "arg": arg, "call": call }),
            json!({}),
        ))
        .await;
        let sprite = &project.sprites[0];
        assert_eq!(sprite.scripts.len(), 1);
        let definition = sprite
            .procedure_definition("jump %s times %b")
            .expect("definition");
        let mutation = definition.mutation.as_ref().expect("mutation");
        assert!(mutation.warp);
        assert_eq!(mutation.argument_ids, vec!["a1", "a2"]);
        assert_eq!(
            mutation.arguments,
            vec![
                ProcedureArgument::Label {
                    text: "jump".to_string()
                },
                ProcedureArgument::NumberOrString {
                    name: "height".to_string(),
                    default: ScalarValue::Number(10.0)
                },
                ProcedureArgument::Label {
                    text: "times".to_string()
                },
                ProcedureArgument::Boolean {
                    name: "fast".to_string(),
                    default: false
                },
            ]
        );
        assert!(definition.inputs.is_empty());

        let call = &sprite.scripts[0].blocks[1];
        assert_eq!(call.proccode(), Some("jump %s times %b"));
        assert_eq!(
            call.input("INPUTS"),
            Some(&BlockInput::ProcedureInputs(vec![
                BlockInput::number(5.0),
                BlockInput::Boolean(false)
            ]))
        );
        assert_eq!(call.inputs.len(), 1);
    }

    #[tokio::test]
    async fn unknown_primitive_tag_is_skipped() {
        let mut say = top("looks_say");
        say["inputs"] = json!({ "MESSAGE": [1, [99, "mystery"]], "OTHER": [1, null] });
        let project = decode(&project_with(json!({ "say": say }), json!({}))).await;
        assert!(project.sprites[0].scripts[0].blocks[0].inputs.is_empty());
    }

    #[tokio::test]
    async fn cyclic_next_chain_is_cut() {
        let mut a = top("looks_show");
        a["next"] = json!("b");
        let mut b = inner("looks_hide", "a");
        b["next"] = json!("a");
        let project = decode(&project_with(json!({ "a": a, "b": b }), json!({}))).await;
        assert_eq!(project.sprites[0].scripts[0].blocks.len(), 2);
    }

    #[tokio::test]
    async fn dangling_block_reference_is_fatal() {
        let mut say = top("looks_say");
        say["inputs"] = json!({ "MESSAGE": [3, "gone", [10, ""]] });
        let err = decode_project(&project_with(json!({ "say": say }), json!({})), Arc::new(NoAssets))
            .await
            .expect_err("missing block");
        assert!(format!("{:#}", err).contains("Missing block 'gone'"));
    }

    #[tokio::test]
    async fn missing_targets_is_fatal() {
        let err = decode_project(&json!({ "meta": {} }), Arc::new(NoAssets))
            .await
            .expect_err("no targets");
        assert!(err.to_string().contains("targets"));
    }

    #[tokio::test]
    async fn decoding_is_deterministic() {
        let mut repeat = top("control_forever");
        repeat["inputs"] = json!({ "SUBSTACK": [2, "body"] });
        let mut body = inner("looks_say", "repeat");
        body["inputs"] = json!({ "MESSAGE": [3, [12, "v", "id"], [10, ""]] });
        let json = project_with(json!({ "repeat": repeat, "body": body }), json!({ "id": ["v", 0] }));
        assert_eq!(decode(&json).await, decode(&json).await);
    }

    #[tokio::test]
    async fn assets_keep_declaration_order_despite_completion_order() {
        let mut json = project_with(json!({}), json!({}));
        json["targets"][1]["costumes"] = json!([
            { "name": "first", "assetId": "aa", "dataFormat": "svg", "rotationCenterX": 10, "rotationCenterY": 4 },
            { "name": "second", "assetId": "bb", "dataFormat": "png", "bitmapResolution": 1 }
        ]);
        json["targets"][1]["sounds"] = json!([
            { "name": "pop", "assetId": "cc", "dataFormat": "wav", "rate": 22050, "sampleCount": 100 }
        ]);
        let project = decode_project(&json, Arc::new(SlowFirstAssets))
            .await
            .expect("decode");
        let sprite = &project.sprites[0];
        assert_eq!(sprite.costumes[0].asset, b"first".to_vec());
        assert_eq!(sprite.costumes[0].bitmap_resolution, 2.0);
        assert_eq!(sprite.costumes[0].center_x, Some(10.0));
        assert_eq!(sprite.costumes[1].asset, b"second".to_vec());
        assert_eq!(sprite.costumes[1].bitmap_resolution, 1.0);
        assert_eq!(sprite.sounds[0].asset, b"pop".to_vec());
        assert_eq!(sprite.sounds[0].sample_rate, Some(22050));
    }

    #[tokio::test]
    async fn asset_failure_propagates() {
        let mut json = project_with(json!({}), json!({}));
        json["targets"][0]["sounds"] = json!([{ "name": "hum", "assetId": "dd", "dataFormat": "mp3" }]);
        let err = decode_project(&json, Arc::new(BrokenAssets))
            .await
            .expect_err("fetch failure");
        let message = format!("{:#}", err);
        assert!(message.contains("sound store offline"));
        assert!(message.contains("dd.mp3"));
    }

    #[test]
    fn tokenizes_proccode() {
        let tokens = tokenize_proccode("letter %n of %s").expect("tokens");
        assert_eq!(
            tokens,
            vec![
                ProccodeToken::Label("letter".to_string()),
                ProccodeToken::Placeholder('n'),
                ProccodeToken::Label("of".to_string()),
                ProccodeToken::Placeholder('s'),
            ]
        );
        let tokens = tokenize_proccode("say hello %b").expect("tokens");
        assert_eq!(tokens[0], ProccodeToken::Label("say hello".to_string()));
        let tokens = tokenize_proccode(r"cost \%s %s").expect("tokens");
        assert_eq!(
            tokens,
            vec![
                ProccodeToken::Label(r"cost \%s".to_string()),
                ProccodeToken::Placeholder('s'),
            ]
        );
    }

    #[test]
    fn coerces_numeric_text() {
        assert_eq!(coerce_number("10"), Some(10.0));
        assert_eq!(coerce_number(" 2.5 "), Some(2.5));
        assert_eq!(coerce_number("1e3"), Some(1000.0));
        assert_eq!(coerce_number("0x1f"), Some(31.0));
        assert_eq!(coerce_number("-Infinity"), Some(f64::NEG_INFINITY));
        assert_eq!(coerce_number(""), None);
        assert_eq!(coerce_number("inf"), None);
        assert_eq!(coerce_number("12px"), None);
        assert_eq!(coerce_number("--1"), None);
    }
}
