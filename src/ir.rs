use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Number(f64),
    String(String),
    Boolean(bool),
}

impl ScalarValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => ScalarValue::Number(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => ScalarValue::Boolean(*b),
            Value::String(s) => ScalarValue::String(s.clone()),
            Value::Null => ScalarValue::String(String::new()),
            other => ScalarValue::String(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::Number(n) => number_value(*n),
            ScalarValue::String(s) => Value::String(s.clone()),
            ScalarValue::Boolean(b) => Value::Bool(*b),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Integral floats serialize as JSON integers so `10.0` is written as `10`.
pub fn number_value(v: f64) -> Value {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Value::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn from_hex(text: &str) -> Option<Self> {
        let hex = text.strip_prefix('#')?;
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
        Some(Self {
            r: channel(0..2)?,
            g: channel(2..4)?,
            b: channel(4..6)?,
        })
    }

    pub fn packed(&self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }
}

/// Non-owning reference to a variable, list or broadcast, resolved by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRef {
    pub id: String,
    pub name: String,
}

impl DataRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Value held by a named input slot of a block.
///
/// Which variant a slot may hold is decided by the opcode's shape, not by the
/// value: a statement slot holds `Blocks`, an expression slot holds `Block` or
/// a literal, a menu slot holds `Menu`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum BlockInput {
    Number(ScalarValue),
    Angle(f64),
    Color(Color),
    String(String),
    Boolean(bool),
    Broadcast(DataRef),
    Variable(DataRef),
    List(DataRef),
    Menu { kind: &'static str, value: String },
    Block(Box<Block>),
    Blocks(Vec<Block>),
    ProcedureInputs(Vec<BlockInput>),
}

impl BlockInput {
    pub fn number(value: f64) -> Self {
        BlockInput::Number(ScalarValue::Number(value))
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            BlockInput::String(s) => Some(s),
            BlockInput::Menu { value, .. } => Some(value),
            BlockInput::Number(value) => value.as_text(),
            BlockInput::Broadcast(r) | BlockInput::Variable(r) | BlockInput::List(r) => {
                Some(&r.name)
            }
            _ => None,
        }
    }

    pub fn data_ref(&self) -> Option<&DataRef> {
        match self {
            BlockInput::Variable(r) | BlockInput::List(r) => Some(r),
            _ => None,
        }
    }

    fn visit_blocks<'a>(&'a self, f: &mut dyn FnMut(&'a Block)) {
        match self {
            BlockInput::Block(block) => block.visit(f),
            BlockInput::Blocks(blocks) => {
                for block in blocks {
                    block.visit(f);
                }
            }
            BlockInput::ProcedureInputs(values) => {
                for value in values {
                    value.visit_blocks(f);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProcedureArgument {
    Label {
        text: String,
    },
    NumberOrString {
        name: String,
        default: ScalarValue,
    },
    Boolean {
        name: String,
        default: bool,
    },
}

/// Mutation carried by `procedures_definition` and `procedures_call` blocks.
///
/// Definitions hold the full signature token list in `arguments`; calls only
/// keep the proccode and argument ids, their values live in the `INPUTS` slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcedureMutation {
    pub proccode: String,
    pub argument_ids: Vec<String>,
    pub arguments: Vec<ProcedureArgument>,
    pub warp: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: String,
    pub opcode: String,
    pub inputs: BTreeMap<String, BlockInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation: Option<ProcedureMutation>,
}

impl Block {
    pub fn new(id: impl Into<String>, opcode: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            opcode: opcode.into(),
            inputs: BTreeMap::new(),
            mutation: None,
        }
    }

    pub fn with_input(mut self, name: &str, input: BlockInput) -> Self {
        self.inputs.insert(name.to_string(), input);
        self
    }

    pub fn with_mutation(mut self, mutation: ProcedureMutation) -> Self {
        self.mutation = Some(mutation);
        self
    }

    pub fn input(&self, name: &str) -> Option<&BlockInput> {
        self.inputs.get(name)
    }

    pub fn proccode(&self) -> Option<&str> {
        self.mutation.as_ref().map(|m| m.proccode.as_str())
    }

    /// Visits this block and every block nested in its inputs, depth first.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Block)) {
        f(self);
        for input in self.inputs.values() {
            input.visit_blocks(f);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Script {
    pub x: f64,
    pub y: f64,
    pub blocks: Vec<Block>,
}

impl Script {
    pub fn new(x: f64, y: f64, blocks: Vec<Block>) -> Self {
        Self { x, y, blocks }
    }

    pub fn head(&self) -> Option<&Block> {
        self.blocks.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Costume {
    pub name: String,
    #[serde(skip)]
    pub asset: Vec<u8>,
    pub md5: String,
    pub ext: String,
    pub bitmap_resolution: f64,
    pub center_x: Option<f64>,
    pub center_y: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sound {
    pub name: String,
    #[serde(skip)]
    pub asset: Vec<u8>,
    pub md5: String,
    pub ext: String,
    pub sample_count: Option<u64>,
    pub sample_rate: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableMode {
    Default,
    Slider,
    Large,
}

impl VariableMode {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "slider" => VariableMode::Slider,
            "large" => VariableMode::Large,
            _ => VariableMode::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variable {
    pub id: String,
    pub name: String,
    pub value: ScalarValue,
    pub cloud: bool,
    pub visible: bool,
    pub mode: VariableMode,
    pub x: f64,
    pub y: f64,
    pub slider_min: f64,
    pub slider_max: f64,
    pub is_discrete: bool,
}

impl Variable {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: ScalarValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            cloud: false,
            visible: true,
            mode: VariableMode::Default,
            x: 0.0,
            y: 0.0,
            slider_min: 0.0,
            slider_max: 100.0,
            is_discrete: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct List {
    pub id: String,
    pub name: String,
    pub value: Vec<ScalarValue>,
    pub visible: bool,
    pub x: f64,
    pub y: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
}

impl List {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: Vec<ScalarValue>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            visible: true,
            x: 0.0,
            y: 0.0,
            width: None,
            height: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RotationStyle {
    Normal,
    LeftRight,
    None,
}

impl RotationStyle {
    pub fn from_sb3(style: &str) -> Self {
        match style {
            "left-right" => RotationStyle::LeftRight,
            "don't rotate" => RotationStyle::None,
            _ => RotationStyle::Normal,
        }
    }

    pub fn as_sb2(&self) -> &'static str {
        match self {
            RotationStyle::Normal => "normal",
            RotationStyle::LeftRight => "leftRight",
            RotationStyle::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpriteState {
    pub x: f64,
    pub y: f64,
    pub size: f64,
    pub direction: f64,
    pub rotation_style: RotationStyle,
    pub is_draggable: bool,
    pub visible: bool,
}

impl Default for SpriteState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            size: 100.0,
            direction: 90.0,
            rotation_style: RotationStyle::Normal,
            is_draggable: false,
            visible: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TargetKind {
    Stage,
    Sprite(SpriteState),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    pub scripts: Vec<Script>,
    pub costumes: Vec<Costume>,
    pub sounds: Vec<Sound>,
    pub variables: Vec<Variable>,
    pub lists: Vec<List>,
    pub costume_number: usize,
    pub volume: f64,
    pub layer_order: i64,
}

impl Target {
    pub fn new(name: impl Into<String>, kind: TargetKind) -> Self {
        Self {
            name: name.into(),
            kind,
            scripts: Vec::new(),
            costumes: Vec::new(),
            sounds: Vec::new(),
            variables: Vec::new(),
            lists: Vec::new(),
            costume_number: 0,
            volume: 100.0,
            layer_order: 0,
        }
    }

    pub fn stage() -> Self {
        Self::new("Stage", TargetKind::Stage)
    }

    pub fn sprite(name: impl Into<String>) -> Self {
        Self::new(name, TargetKind::Sprite(SpriteState::default()))
    }

    pub fn sprite_state(&self) -> Option<&SpriteState> {
        match &self.kind {
            TargetKind::Sprite(state) => Some(state),
            TargetKind::Stage => None,
        }
    }

    pub fn variable(&self, id: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.id == id)
    }

    pub fn list(&self, id: &str) -> Option<&List> {
        self.lists.iter().find(|l| l.id == id)
    }

    /// Finds the top-level `procedures_definition` whose proccode matches.
    pub fn procedure_definition(&self, proccode: &str) -> Option<&Block> {
        self.scripts
            .iter()
            .filter_map(Script::head)
            .find(|b| b.opcode == "procedures_definition" && b.proccode() == Some(proccode))
    }

    /// Every block of every script, nested expression and statement blocks included.
    pub fn blocks(&self) -> Vec<&Block> {
        let mut out = Vec::new();
        for script in &self.scripts {
            for block in &script.blocks {
                block.visit(&mut |b| out.push(b));
            }
        }
        out
    }

    pub fn collect_data_references(&self, out: &mut HashSet<String>) {
        for block in self.blocks() {
            for input in block.inputs.values() {
                if let Some(r) = input.data_ref() {
                    out.insert(r.id.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Project {
    pub stage: Target,
    pub sprites: Vec<Target>,
    pub tempo: f64,
    pub video_on: bool,
    pub video_transparency: f64,
}

impl Project {
    pub fn new(stage: Target, sprites: Vec<Target>) -> Self {
        Self {
            stage,
            sprites,
            tempo: 60.0,
            video_on: false,
            video_transparency: 50.0,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        std::iter::once(&self.stage).chain(self.sprites.iter())
    }
}
