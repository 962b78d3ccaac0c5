use crate::ir::{
    number_value, Block, BlockInput, Costume, ProcedureArgument, Project, Script, Sound, Target,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SoundFormat {
    Uncompressed,
    Adpcm,
    Squeak,
}

impl SoundFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoundFormat::Uncompressed => "",
            SoundFormat::Adpcm => "adpcm",
            SoundFormat::Squeak => "squeak",
        }
    }
}

/// Tags a sound by its WAV `fmt ` chunk: IMA ADPCM (`0x11`) is `Adpcm`, anything else `Uncompressed`.
pub fn wav_sound_format(sound: &Sound) -> SoundFormat {
    const IMA_ADPCM: u16 = 0x11;
    let data = &sound.asset;
    if sound.ext != "wav" || data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return SoundFormat::Uncompressed;
    }
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let id = &data[offset..offset + 4];
        let size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let body = offset + 8;
        if id == b"fmt " {
            if body + 2 <= data.len()
                && u16::from_le_bytes([data[body], data[body + 1]]) == IMA_ADPCM
            {
                return SoundFormat::Adpcm;
            }
            break;
        }
        offset = body + size + (size & 1);
    }
    SoundFormat::Uncompressed
}

type ConvertSoundFn<'a> = dyn Fn(&Sound) -> Sound + 'a;
type SoundFormatFn<'a> = dyn Fn(&Sound) -> SoundFormat + 'a;

pub struct EncodeOptions<'a> {
    pub pen_costume: Option<Costume>,
    convert_unsupported_sound: Box<ConvertSoundFn<'a>>,
    sound_format: Box<SoundFormatFn<'a>>,
}

impl<'a> EncodeOptions<'a> {
    /// `convert` receives every sound that is not already `wav`; `format` tags
    /// each sound as it is written.
    pub fn new<C, F>(convert: C, format: F) -> Self
    where
        C: Fn(&Sound) -> Sound + 'a,
        F: Fn(&Sound) -> SoundFormat + 'a,
    {
        Self {
            pen_costume: None,
            convert_unsupported_sound: Box::new(convert),
            sound_format: Box::new(format),
        }
    }

    pub fn with_pen_costume(mut self, costume: Costume) -> Self {
        self.pen_costume = Some(costume);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssetSource {
    Costume(Costume),
    Sound(Sound),
}

impl AssetSource {
    pub fn name(&self) -> &str {
        match self {
            AssetSource::Costume(c) => &c.name,
            AssetSource::Sound(s) => &s.name,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            AssetSource::Costume(c) => &c.asset,
            AssetSource::Sound(s) => &s.asset,
        }
    }
}

/// Assets grouped by extension; a source's index in its group is its assigned id.
pub type AssetTable = BTreeMap<String, Vec<AssetSource>>;

#[derive(Debug, Clone)]
pub struct Sb2Output {
    pub project: Value,
    pub assets: AssetTable,
}

impl Sb2Output {
    /// Archive entry names (`<id>.<ext>`) paired with the bytes stored under them.
    pub fn asset_files(&self) -> Vec<(String, &[u8])> {
        let mut out = Vec::new();
        for (ext, sources) in &self.assets {
            for (id, source) in sources.iter().enumerate() {
                out.push((format!("{}.{}", id, ext), source.bytes()));
            }
        }
        out
    }
}

pub fn encode_project(project: &Project, options: &EncodeOptions<'_>) -> Sb2Output {
    let mut encoder = ProjectEncoder::new(project, options);
    let stage = encoder.stage_json();
    info!(
        sprites = project.sprites.len(),
        asset_groups = encoder.assets.len(),
        "encoded legacy project"
    );
    Sb2Output {
        project: stage,
        assets: encoder.assets,
    }
}

/// Auxiliary output a translated block needs spliced elsewhere.
#[derive(Debug, Default, Clone, PartialEq)]
struct Dependencies {
    /// Statements to run right before the statement that produced them.
    stack: Vec<Value>,
    /// Whole scripts to add to the owning target.
    target: Vec<Value>,
}

impl Dependencies {
    fn merge(&mut self, mut other: Dependencies) {
        self.stack.append(&mut other.stack);
        self.target.append(&mut other.target);
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Emitted {
    value: Value,
    deps: Dependencies,
}

struct ProjectEncoder<'p, 'o> {
    project: &'p Project,
    options: &'p EncodeOptions<'o>,
    assets: AssetTable,
}

impl<'p, 'o> ProjectEncoder<'p, 'o> {
    fn new(project: &'p Project, options: &'p EncodeOptions<'o>) -> Self {
        Self {
            project,
            options,
            assets: AssetTable::new(),
        }
    }

    fn register(&mut self, ext: &str, source: AssetSource) -> usize {
        let group = self.assets.entry(ext.to_string()).or_default();
        group.push(source);
        group.len() - 1
    }

    fn stage_json(&mut self) -> Value {
        let project = self.project;
        let options = self.options;
        let mut stage = self.target_json(&project.stage);
        if let Some(pen) = &options.pen_costume {
            stage.insert("penLayerMD5".into(), json!(format!("{}.{}", pen.md5, pen.ext)));
            let id = self.register(&pen.ext, AssetSource::Costume(pen.clone()));
            stage.insert("penLayerID".into(), json!(id));
        }
        stage.insert("tempoBPM".into(), number_value(project.tempo));
        stage.insert(
            "videoAlpha".into(),
            number_value(1.0 - project.video_transparency / 100.0),
        );
        let children = project
            .sprites
            .iter()
            .enumerate()
            .map(|(index, sprite)| self.sprite_json(sprite, index))
            .collect::<Vec<_>>();
        stage.insert("children".into(), Value::Array(children));
        let info = if project.video_on {
            json!({ "videoOn": true })
        } else {
            json!({})
        };
        stage.insert("info".into(), info);
        Value::Object(stage)
    }

    fn sprite_json(&mut self, sprite: &Target, index: usize) -> Value {
        let state = sprite.sprite_state().cloned().unwrap_or_default();
        let mut out = self.target_json(sprite);
        out.insert("scratchX".into(), number_value(state.x));
        out.insert("scratchY".into(), number_value(state.y));
        out.insert("scale".into(), number_value(state.size / 100.0));
        out.insert("direction".into(), number_value(state.direction));
        out.insert("rotationStyle".into(), json!(state.rotation_style.as_sb2()));
        out.insert("isDraggable".into(), json!(state.is_draggable));
        out.insert("visible".into(), json!(state.visible));
        out.insert("indexInLibrary".into(), json!(index));
        Value::Object(out)
    }

    fn target_json(&mut self, target: &Target) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("objName".into(), json!(target.name));
        out.insert("currentCostumeIndex".into(), json!(target.costume_number));
        out.insert(
            "scripts".into(),
            Value::Array(ScriptEncoder::new(target).scripts()),
        );
        let sounds = target
            .sounds
            .iter()
            .map(|sound| self.sound_json(target, sound))
            .collect::<Vec<_>>();
        out.insert("sounds".into(), Value::Array(sounds));
        let costumes = target
            .costumes
            .iter()
            .map(|costume| self.costume_json(costume))
            .collect::<Vec<_>>();
        out.insert("costumes".into(), Value::Array(costumes));
        let variables = target
            .variables
            .iter()
            .map(|v| {
                json!({
                    "name": v.name,
                    "value": v.value.to_json(),
                    "isPersistent": v.cloud
                })
            })
            .collect::<Vec<_>>();
        out.insert("variables".into(), Value::Array(variables));
        let lists = target
            .lists
            .iter()
            .map(|l| {
                json!({
                    "listName": l.name,
                    "contents": l.value.iter().map(|item| item.to_json()).collect::<Vec<_>>(),
                    "isPersistent": false,
                    "x": number_value(l.x),
                    "y": number_value(l.y),
                    "width": l.width.map(number_value),
                    "height": l.height.map(number_value),
                    "visible": l.visible
                })
            })
            .collect::<Vec<_>>();
        out.insert("lists".into(), Value::Array(lists));
        out
    }

    fn sound_json(&mut self, owner: &Target, sound: &Sound) -> Value {
        let sound = if sound.ext == "wav" {
            sound.clone()
        } else {
            debug!(owner = %owner.name, sound = %sound.name, ext = %sound.ext, "converting sound");
            (self.options.convert_unsupported_sound)(sound)
        };
        let format = (self.options.sound_format)(&sound);
        let id = self.register(&sound.ext, AssetSource::Sound(sound.clone()));
        json!({
            "soundName": sound.name,
            "soundID": id,
            "md5": format!("{}.{}", sound.md5, sound.ext),
            "sampleCount": sound.sample_count,
            "rate": sound.sample_rate,
            "format": format.as_str()
        })
    }

    fn costume_json(&mut self, costume: &Costume) -> Value {
        let id = self.register(&costume.ext, AssetSource::Costume(costume.clone()));
        let resolution = costume.bitmap_resolution;
        let center = |c: Option<f64>| c.map(|c| number_value(c / resolution));
        json!({
            "costumeName": costume.name,
            "baseLayerID": id,
            "baseLayerMD5": format!("{}.{}", costume.md5, costume.ext),
            "bitmapResolution": number_value(resolution),
            "rotationCenterX": center(costume.center_x),
            "rotationCenterY": center(costume.center_y)
        })
    }
}

/// Human-readable legacy spec of a procedure signature, e.g. `"jump %s times %b"`.
fn procedure_spec(arguments: &[ProcedureArgument]) -> String {
    arguments
        .iter()
        .map(|argument| match argument {
            ProcedureArgument::Label { text } => text.as_str(),
            ProcedureArgument::NumberOrString { .. } => "%s",
            ProcedureArgument::Boolean { .. } => "%b",
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Translates the scripts of one target into legacy token arrays.
struct ScriptEncoder<'p> {
    target: &'p Target,
}

impl<'p> ScriptEncoder<'p> {
    fn new(target: &'p Target) -> Self {
        Self { target }
    }

    fn scripts(&self) -> Vec<Value> {
        let mut out = Vec::new();
        for script in &self.target.scripts {
            let emitted = self.script(script);
            out.push(emitted.value);
            out.extend(emitted.deps.target);
        }
        out
    }

    fn script(&self, script: &Script) -> Emitted {
        let stack = self.stack(&script.blocks);
        Emitted {
            value: json!([number_value(script.x), number_value(script.y), stack.value]),
            deps: stack.deps,
        }
    }

    /// Statement-stack mode: each block's `stack` dependencies are spliced in
    /// front of it, so only `target` dependencies leave this call.
    fn stack(&self, blocks: &[Block]) -> Emitted {
        let mut tokens = Vec::new();
        let mut deps = Dependencies::default();
        for block in blocks {
            let mut emitted = self.block(block);
            tokens.append(&mut emitted.deps.stack);
            tokens.push(emitted.value);
            deps.target.append(&mut emitted.deps.target);
        }
        Emitted {
            value: Value::Array(tokens),
            deps,
        }
    }

    fn block(&self, block: &Block) -> Emitted {
        let mut args = BlockArgs {
            encoder: self,
            block,
            deps: Dependencies::default(),
        };
        let value = args.translate();
        Emitted {
            value,
            deps: args.deps,
        }
    }

    fn procedure_call_spec(&self, block: &Block) -> String {
        let proccode = block.proccode().unwrap_or_default();
        match self
            .target
            .procedure_definition(proccode)
            .and_then(|definition| definition.mutation.as_ref())
        {
            Some(mutation) => procedure_spec(&mutation.arguments),
            None => {
                warn!(
                    owner = %self.target.name,
                    block = %block.id,
                    proccode,
                    "procedure call has no definition, writing empty spec"
                );
                String::new()
            }
        }
    }
}

/// Serialized inputs of one block, with the dependencies they raised.
struct BlockArgs<'e, 'p> {
    encoder: &'e ScriptEncoder<'p>,
    block: &'e Block,
    deps: Dependencies,
}

impl<'e, 'p> BlockArgs<'e, 'p> {
    /// Expression mode.
    fn i(&mut self, key: &str) -> Value {
        let block = self.block;
        match block.input(key) {
            Some(input) => self.value(input),
            None => Value::Null,
        }
    }

    /// Statement-stack mode.
    fn sub(&mut self, key: &str) -> Value {
        let block = self.block;
        let emitted = match block.input(key) {
            Some(BlockInput::Block(block)) => self.encoder.stack(std::slice::from_ref(block)),
            Some(BlockInput::Blocks(blocks)) => self.encoder.stack(blocks),
            Some(other) => return self.value(other),
            None => return Value::Null,
        };
        self.deps.merge(emitted.deps);
        emitted.value
    }

    fn text(&self, key: &str) -> &str {
        self.block
            .input(key)
            .and_then(BlockInput::text)
            .unwrap_or_default()
    }

    fn value(&mut self, input: &BlockInput) -> Value {
        match input {
            BlockInput::Number(value) => value.to_json(),
            BlockInput::Angle(angle) => number_value(*angle),
            BlockInput::Color(color) => json!(color.packed()),
            BlockInput::String(text) => Value::String(text.clone()),
            BlockInput::Boolean(b) => Value::Bool(*b),
            BlockInput::Broadcast(r) | BlockInput::Variable(r) | BlockInput::List(r) => {
                Value::String(r.name.clone())
            }
            BlockInput::Menu { value, .. } => Value::String(value.clone()),
            BlockInput::Block(block) => {
                let emitted = self.encoder.block(block);
                self.deps.merge(emitted.deps);
                emitted.value
            }
            BlockInput::Blocks(blocks) => {
                let emitted = self.encoder.stack(blocks);
                self.deps.merge(emitted.deps);
                emitted.value
            }
            BlockInput::ProcedureInputs(values) => {
                Value::Array(values.iter().map(|v| self.value(v)).collect())
            }
        }
    }

    fn translate(&mut self) -> Value {
        let block = self.block;
        match block.opcode.as_str() {
            "motion_movesteps" => json!(["forward:", self.i("STEPS")]),
            "motion_turnright" => json!(["turnRight:", self.i("DEGREES")]),
            "motion_turnleft" => json!(["turnLeft:", self.i("DEGREES")]),
            "motion_pointindirection" => json!(["heading:", self.i("DIRECTION")]),
            "motion_pointtowards" => json!(["pointTowards:", self.i("TOWARDS")]),
            "motion_gotoxy" => json!(["gotoX:y:", self.i("X"), self.i("Y")]),
            "motion_goto" => json!(["gotoSpriteOrMouse:", self.i("TO")]),
            "motion_glidesecstoxy" => json!([
                "glideSecs:toX:y:elapsed:from:",
                self.i("SECS"),
                self.i("X"),
                self.i("Y")
            ]),
            "motion_changexby" => json!(["changeXposBy:", self.i("DX")]),
            "motion_setx" => json!(["xpos:", self.i("X")]),
            "motion_changeyby" => json!(["changeYposBy:", self.i("DY")]),
            "motion_sety" => json!(["ypos:", self.i("Y")]),
            "motion_ifonedgebounce" => json!(["bounceOffEdge"]),
            "motion_setrotationstyle" => json!(["setRotationStyle", self.i("STYLE")]),
            "motion_xposition" => json!(["xpos"]),
            "motion_yposition" => json!(["ypos"]),
            "motion_direction" => json!(["heading"]),
            "motion_scroll_right" => json!(["scrollRight", self.i("DISTANCE")]),
            "motion_scroll_up" => json!(["scrollUp", self.i("DISTANCE")]),
            "motion_align_scene" => json!(["scrollAlign", self.i("ALIGNMENT")]),
            "motion_xscroll" => json!(["xScroll"]),
            "motion_yscroll" => json!(["yScroll"]),

            "looks_sayforsecs" => json!([
                "say:duration:elapsed:from:",
                self.i("MESSAGE"),
                self.i("SECS")
            ]),
            "looks_say" => json!(["say:", self.i("MESSAGE")]),
            "looks_thinkforsecs" => json!([
                "think:duration:elapsed:from:",
                self.i("MESSAGE"),
                self.i("SECS")
            ]),
            "looks_think" => json!(["think:", self.i("MESSAGE")]),
            "looks_show" => json!(["show"]),
            "looks_hide" => json!(["hide"]),
            "looks_hideallsprites" => json!(["hideAll"]),
            "looks_switchcostumeto" => json!(["lookLike:", self.i("COSTUME")]),
            "looks_nextcostume" => json!(["nextCostume"]),
            "looks_switchbackdropto" => json!(["startScene", self.i("BACKDROP")]),
            "looks_switchbackdroptoandwait" => json!(["startSceneAndWait", self.i("BACKDROP")]),
            "looks_nextbackdrop" => json!(["nextScene"]),
            "looks_changeeffectby" => {
                json!(["changeGraphicEffect:by:", self.i("EFFECT"), self.i("CHANGE")])
            }
            "looks_seteffectto" => json!(["setGraphicEffect:to:", self.i("EFFECT"), self.i("VALUE")]),
            "looks_cleargraphiceffects" => json!(["filterReset"]),
            "looks_changesizeby" => json!(["changeSizeBy:", self.i("CHANGE")]),
            "looks_setsizeto" => json!(["setSizeTo:", self.i("SIZE")]),
            "looks_changestretchby" => json!(["changeStretchBy:", self.i("CHANGE")]),
            "looks_setstretchto" => json!(["setStretchTo:", self.i("STRETCH")]),
            "looks_gotofrontback" => {
                if self.text("FRONT_BACK") == "front" {
                    json!(["comeToFront"])
                } else {
                    json!(["goBackByLayers:", ["/", 1, 0]])
                }
            }
            "looks_goforwardbackwardlayers" => {
                let layers = self.i("NUM");
                if self.text("FORWARD_BACKWARD") != "forward" {
                    json!(["goBackByLayers:", layers])
                } else if let Some(n) = layers.as_f64() {
                    json!(["goBackByLayers:", number_value(-n)])
                } else {
                    json!(["goBackByLayers:", ["-", 0, layers]])
                }
            }
            "looks_costumenumbername" => {
                if self.text("NUMBER_NAME") == "number" {
                    json!(["costumeIndex"])
                } else {
                    json!(["costumeName"])
                }
            }
            "looks_backdropnumbername" => {
                if self.text("NUMBER_NAME") == "number" {
                    json!(["backgroundIndex"])
                } else {
                    json!(["sceneName"])
                }
            }
            "looks_size" => json!(["scale"]),

            "sound_play" => json!(["playSound:", self.i("SOUND_MENU")]),
            "sound_playuntildone" => json!(["doPlaySoundAndWait", self.i("SOUND_MENU")]),
            "sound_stopallsounds" => json!(["stopAllSounds"]),
            "sound_changevolumeby" => json!(["changeVolumeBy:", self.i("VOLUME")]),
            "sound_setvolumeto" => json!(["setVolumeTo:", self.i("VOLUME")]),
            "sound_volume" => json!(["volume"]),
            "music_playDrumForBeats" => json!(["playDrum", self.i("DRUM"), self.i("BEATS")]),
            "music_midiPlayDrumForBeats" => {
                json!(["drum:duration:elapsed:from:", self.i("DRUM"), self.i("BEATS")])
            }
            "music_restForBeats" => json!(["rest:elapsed:from:", self.i("BEATS")]),
            "music_playNoteForBeats" => {
                json!(["noteOn:duration:elapsed:from:", self.i("NOTE"), self.i("BEATS")])
            }
            "music_setInstrument" => json!(["instrument:", self.i("INSTRUMENT")]),
            "music_midiSetInstrument" => json!(["midiInstrument:", self.i("INSTRUMENT")]),
            "music_changeTempo" => json!(["changeTempoBy:", self.i("TEMPO")]),
            "music_setTempo" => json!(["setTempoTo:", self.i("TEMPO")]),
            "music_getTempo" => json!(["tempo"]),

            "pen_clear" => json!(["clearPenTrails"]),
            "pen_stamp" => json!(["stampCostume"]),
            "pen_penDown" => json!(["putPenDown"]),
            "pen_penUp" => json!(["putPenUp"]),
            "pen_setPenColorToColor" => json!(["penColor:", self.i("COLOR")]),
            "pen_changePenHueBy" => json!(["changePenHueBy:", self.i("HUE")]),
            "pen_setPenHueToNumber" => json!(["setPenHueTo:", self.i("HUE")]),
            "pen_changePenShadeBy" => json!(["changePenShadeBy:", self.i("SHADE")]),
            "pen_setPenShadeToNumber" => json!(["setPenShadeTo:", self.i("SHADE")]),
            "pen_changePenSizeBy" => json!(["changePenSizeBy:", self.i("SIZE")]),
            "pen_setPenSizeTo" => json!(["penSize:", self.i("SIZE")]),

            "videoSensing_videoOn" => {
                json!(["senseVideoMotion", self.i("ATTRIBUTE"), self.i("SUBJECT")])
            }
            "videoSensing_whenMotionGreaterThan" => {
                json!(["whenSensorGreaterThan", "video motion", self.i("REFERENCE")])
            }
            "videoSensing_videoToggle" => json!(["setVideoState", self.i("VIDEO_STATE")]),
            "videoSensing_setVideoTransparency" => {
                json!(["setVideoTransparency", self.i("TRANSPARENCY")])
            }

            "event_whenflagclicked" => json!(["whenGreenFlag"]),
            "event_whenkeypressed" => json!(["whenKeyPressed", self.i("KEY_OPTION")]),
            "event_whenthisspriteclicked" | "event_whenstageclicked" => json!(["whenClicked"]),
            "event_whenbackdropswitchesto" => json!(["whenSceneStarts", self.i("BACKDROP")]),
            "event_whengreaterthan" => json!([
                "whenSensorGreaterThan",
                self.i("WHENGREATERTHANMENU"),
                self.i("VALUE")
            ]),
            "event_whenbroadcastreceived" => json!(["whenIReceive", self.i("BROADCAST_OPTION")]),
            "event_broadcast" => json!(["broadcast:", self.i("BROADCAST_INPUT")]),
            "event_broadcastandwait" => json!(["doBroadcastAndWait", self.i("BROADCAST_INPUT")]),

            "control_wait" => json!(["wait:elapsed:from:", self.i("DURATION")]),
            "control_repeat" => json!(["doRepeat", self.i("TIMES"), self.sub("SUBSTACK")]),
            "control_forever" => json!(["doForever", self.sub("SUBSTACK")]),
            "control_if" => json!(["doIf", self.i("CONDITION"), self.sub("SUBSTACK")]),
            "control_if_else" => json!([
                "doIfElse",
                self.i("CONDITION"),
                self.sub("SUBSTACK"),
                self.sub("SUBSTACK2")
            ]),
            "control_wait_until" => json!(["doWaitUntil", self.i("CONDITION")]),
            "control_repeat_until" => json!(["doUntil", self.i("CONDITION"), self.sub("SUBSTACK")]),
            "control_while" => json!(["doWhile", self.i("CONDITION"), self.sub("SUBSTACK")]),
            "control_for_each" => json!([
                "doForLoop",
                self.i("VARIABLE"),
                self.i("VALUE"),
                self.sub("SUBSTACK")
            ]),
            "control_stop" => json!(["stopScripts", self.i("STOP_OPTION")]),
            "control_start_as_clone" => json!(["whenCloned"]),
            "control_create_clone_of" => json!(["createCloneOf", self.i("CLONE_OPTION")]),
            "control_delete_this_clone" => json!(["deleteClone"]),
            "control_get_counter" => json!(["COUNT"]),
            "control_incr_counter" => json!(["INCR_COUNT"]),
            "control_clear_counter" => json!(["CLR_COUNT"]),
            "control_all_at_once" => json!(["warpSpeed", self.sub("SUBSTACK")]),

            "sensing_touchingobject" => json!(["touching:", self.i("TOUCHINGOBJECTMENU")]),
            "sensing_touchingcolor" => json!(["touchingColor:", self.i("COLOR")]),
            "sensing_coloristouchingcolor" => {
                json!(["color:sees:", self.i("COLOR"), self.i("COLOR2")])
            }
            "sensing_distanceto" => json!(["distanceTo:", self.i("DISTANCETOMENU")]),
            "sensing_askandwait" => json!(["doAsk", self.i("QUESTION")]),
            "sensing_answer" => json!(["answer"]),
            "sensing_keypressed" => json!(["keyPressed:", self.i("KEY_OPTION")]),
            "sensing_mousedown" => json!(["mousePressed"]),
            "sensing_mousex" => json!(["mouseX"]),
            "sensing_mousey" => json!(["mouseY"]),
            "sensing_loudness" => json!(["soundLevel"]),
            "sensing_loud" => json!(["isLoud"]),
            "sensing_timer" => json!(["timer"]),
            "sensing_resettimer" => json!(["timerReset"]),
            "sensing_of" => json!(["getAttribute:of:", self.i("PROPERTY"), self.i("OBJECT")]),
            "sensing_current" => json!(["timeAndDate", self.i("CURRENTMENU")]),
            "sensing_dayssince2000" => json!(["timestamp"]),
            "sensing_userid" => json!(["getUserId"]),

            "operator_add" => json!(["+", self.i("NUM1"), self.i("NUM2")]),
            "operator_subtract" => json!(["-", self.i("NUM1"), self.i("NUM2")]),
            "operator_multiply" => json!(["*", self.i("NUM1"), self.i("NUM2")]),
            "operator_divide" => json!(["/", self.i("NUM1"), self.i("NUM2")]),
            "operator_random" => json!(["randomFrom:to:", self.i("FROM"), self.i("TO")]),
            "operator_lt" => json!(["<", self.i("OPERAND1"), self.i("OPERAND2")]),
            "operator_equals" => json!(["=", self.i("OPERAND1"), self.i("OPERAND2")]),
            "operator_gt" => json!([">", self.i("OPERAND1"), self.i("OPERAND2")]),
            "operator_and" => json!(["&", self.i("OPERAND1"), self.i("OPERAND2")]),
            "operator_or" => json!(["|", self.i("OPERAND1"), self.i("OPERAND2")]),
            "operator_not" => json!(["not", self.i("OPERAND")]),
            "operator_join" => json!(["concatenate:with:", self.i("STRING1"), self.i("STRING2")]),
            "operator_letter_of" => json!(["letter:of:", self.i("LETTER"), self.i("STRING")]),
            "operator_length" => json!(["stringLength:", self.i("STRING")]),
            "operator_mod" => json!(["%", self.i("NUM1"), self.i("NUM2")]),
            "operator_round" => json!(["rounded", self.i("NUM")]),
            "operator_mathop" => json!(["computeFunction:of:", self.i("OPERATOR"), self.i("NUM")]),

            "data_variable" => json!(["readVariable", self.i("VARIABLE")]),
            "data_setvariableto" => json!(["setVar:to:", self.i("VARIABLE"), self.i("VALUE")]),
            "data_changevariableby" => {
                json!(["changeVar:by:", self.i("VARIABLE"), self.i("VALUE")])
            }
            "data_showvariable" => json!(["showVariable:", self.i("VARIABLE")]),
            "data_hidevariable" => json!(["hideVariable:", self.i("VARIABLE")]),
            "data_listcontents" => json!(["contentsOfList:", self.i("LIST")]),
            "data_addtolist" => json!(["append:toList:", self.i("ITEM"), self.i("LIST")]),
            "data_deleteoflist" => json!(["deleteLine:ofList:", self.i("INDEX"), self.i("LIST")]),
            "data_deletealloflist" => json!(["deleteLine:ofList:", "all", self.i("LIST")]),
            "data_insertatlist" => json!([
                "insert:at:ofList:",
                self.i("ITEM"),
                self.i("INDEX"),
                self.i("LIST")
            ]),
            "data_replaceitemoflist" => json!([
                "setLine:ofList:to:",
                self.i("INDEX"),
                self.i("LIST"),
                self.i("ITEM")
            ]),
            "data_itemoflist" => json!(["getLine:ofList:", self.i("INDEX"), self.i("LIST")]),
            "data_itemnumoflist" => self.item_number_of_list(),
            "data_lengthoflist" => json!(["lineCountOfList:", self.i("LIST")]),
            "data_listcontainsitem" => json!(["list:contains:", self.i("LIST"), self.i("ITEM")]),
            "data_showlist" => json!(["showList:", self.i("LIST")]),
            "data_hidelist" => json!(["hideList:", self.i("LIST")]),

            "procedures_definition" => self.procedure_definition(),
            "procedures_call" => self.procedure_call(),
            "argument_reporter_string_number" => json!(["getParam", self.text("VALUE"), "r"]),
            "argument_reporter_boolean" => json!(["getParam", self.text("VALUE"), "b"]),

            other => {
                debug!(block = %block.id, opcode = other, "no legacy translation, writing placeholder");
                json!(["undefined", other])
            }
        }
    }

    /// The legacy schema has no "item # of" reporter; it is emulated by a
    /// hidden warp procedure that scans the list into a per-block variable.
    fn item_number_of_list(&mut self) -> Value {
        let variable = format!("Index {}", self.block.id);
        let spec = format!("calculate {}", variable);
        let list = self.i("LIST");
        let item = self.i("ITEM");
        self.deps.stack.push(json!(["call", spec]));
        self.deps.target.push(json!([0, 0, [
            ["procDef", spec, [], [], true],
            ["setVar:to:", variable, 1],
            ["doUntil",
                ["|",
                    ["=", ["getLine:ofList:", ["readVariable", variable], list], item],
                    [">", ["readVariable", variable], ["lineCountOfList:", list]]
                ],
                [["changeVar:by:", variable, 1]]
            ]
        ]]));
        json!(["readVariable", variable])
    }

    fn procedure_definition(&self) -> Value {
        let Some(mutation) = self.block.mutation.as_ref() else {
            warn!(block = %self.block.id, "procedure definition without signature");
            return json!(["procDef", "", [], [], false]);
        };
        let mut names = Vec::new();
        let mut defaults = Vec::new();
        for argument in &mutation.arguments {
            match argument {
                ProcedureArgument::Label { .. } => {}
                ProcedureArgument::NumberOrString { name, .. } => {
                    names.push(json!(name));
                    defaults.push(json!(""));
                }
                ProcedureArgument::Boolean { name, .. } => {
                    names.push(json!(name));
                    defaults.push(json!(false));
                }
            }
        }
        json!([
            "procDef",
            procedure_spec(&mutation.arguments),
            names,
            defaults,
            mutation.warp
        ])
    }

    fn procedure_call(&mut self) -> Value {
        let mut token = vec![
            json!("call"),
            json!(self.encoder.procedure_call_spec(self.block)),
        ];
        let block = self.block;
        if let Some(BlockInput::ProcedureInputs(values)) = block.input("INPUTS") {
            for value in values {
                token.push(self.value(value));
            }
        }
        Value::Array(token)
    }
}
