//! Static tables describing the current-schema block shapes the decoder relies on.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    SameBlockShadow,
    BlockNoShadow,
    DiffBlockShadow,
    MathNumber,
    PositiveNumber,
    WholeNumber,
    IntegerNumber,
    AngleNumber,
    ColorPicker,
    Text,
    Broadcast,
    Variable,
    List,
}

impl InputStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        let status = match code {
            1 => InputStatus::SameBlockShadow,
            2 => InputStatus::BlockNoShadow,
            3 => InputStatus::DiffBlockShadow,
            4 => InputStatus::MathNumber,
            5 => InputStatus::PositiveNumber,
            6 => InputStatus::WholeNumber,
            7 => InputStatus::IntegerNumber,
            8 => InputStatus::AngleNumber,
            9 => InputStatus::ColorPicker,
            10 => InputStatus::Text,
            11 => InputStatus::Broadcast,
            12 => InputStatus::Variable,
            13 => InputStatus::List,
            _ => return None,
        };
        Some(status)
    }
}

/// How a field value is represented once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Variable,
    List,
    Broadcast,
    Number,
    String,
    Menu(&'static str),
}

pub fn field_types(opcode: &str) -> Option<&'static [(&'static str, FieldKind)]> {
    use FieldKind::*;
    let table: &'static [(&'static str, FieldKind)] = match opcode {
        "motion_setrotationstyle" => &[("STYLE", Menu("rotationStyle"))],
        "motion_align_scene" => &[("ALIGNMENT", Menu("scrollAlignment"))],
        "looks_gotofrontback" => &[("FRONT_BACK", Menu("frontBackMenu"))],
        "looks_goforwardbackwardlayers" => &[("FORWARD_BACKWARD", Menu("forwardBackwardMenu"))],
        "looks_changeeffectby" | "looks_seteffectto" => &[("EFFECT", Menu("graphicEffect"))],
        "looks_backdropnumbername" | "looks_costumenumbername" => {
            &[("NUMBER_NAME", Menu("costumeNumberName"))]
        }
        "sound_seteffectto" | "sound_changeeffectby" => &[("EFFECT", Menu("soundEffect"))],
        "event_whenkeypressed" => &[("KEY_OPTION", Menu("key"))],
        "event_whenbackdropswitchesto" => &[("BACKDROP", Menu("backdrop"))],
        "event_whengreaterthan" => &[("WHENGREATERTHANMENU", Menu("greaterThanMenu"))],
        "event_whenbroadcastreceived" | "event_broadcast_menu" => {
            &[("BROADCAST_OPTION", Broadcast)]
        }
        "control_stop" => &[("STOP_OPTION", Menu("stopMenu"))],
        "sensing_setdragmode" => &[("DRAG_MODE", Menu("dragModeMenu"))],
        "sensing_of" => &[("PROPERTY", Menu("propertyOfMenu"))],
        "sensing_current" => &[("CURRENTMENU", Menu("currentMenu"))],
        "operator_mathop" => &[("OPERATOR", Menu("mathopMenu"))],
        "control_for_each"
        | "data_variable"
        | "data_setvariableto"
        | "data_changevariableby"
        | "data_showvariable"
        | "data_hidevariable" => &[("VARIABLE", Variable)],
        "data_listcontents"
        | "data_addtolist"
        | "data_deleteoflist"
        | "data_deletealloflist"
        | "data_insertatlist"
        | "data_replaceitemoflist"
        | "data_itemoflist"
        | "data_itemnumoflist"
        | "data_lengthoflist"
        | "data_listcontainsitem"
        | "data_showlist"
        | "data_hidelist" => &[("LIST", List)],
        "argument_reporter_string_number" | "argument_reporter_boolean" => &[("VALUE", String)],

        // shadow menus, inlined into the block that owns them
        "motion_pointtowards_menu" => &[("TOWARDS", Menu("pointTowardsTarget"))],
        "motion_glideto_menu" | "motion_goto_menu" => &[("TO", Menu("goToTarget"))],
        "looks_costume" => &[("COSTUME", Menu("costume"))],
        "looks_backdrops" => &[("BACKDROP", Menu("backdrop"))],
        "sound_sounds_menu" => &[("SOUND_MENU", Menu("sound"))],
        "control_create_clone_of_menu" => &[("CLONE_OPTION", Menu("cloneTarget"))],
        "sensing_touchingobjectmenu" => &[("TOUCHINGOBJECTMENU", Menu("touchingTarget"))],
        "sensing_distancetomenu" => &[("DISTANCETOMENU", Menu("distanceToMenu"))],
        "sensing_keyoptions" => &[("KEY_OPTION", Menu("key"))],
        "sensing_of_object_menu" => &[("OBJECT", Menu("target"))],
        // the owning blocks name this slot COLOR_PARAM
        "pen_menu_colorParam" => &[("colorParam", Menu("penColorParam"))],
        "music_menu_DRUM" => &[("DRUM", Menu("musicDrum"))],
        "music_menu_INSTRUMENT" => &[("INSTRUMENT", Menu("musicInstrument"))],
        "note" => &[("NOTE", Number)],
        "videoSensing_menu_ATTRIBUTE" => &[("ATTRIBUTE", Menu("videoSensingAttribute"))],
        "videoSensing_menu_SUBJECT" => &[("SUBJECT", Menu("videoSensingSubject"))],
        "videoSensing_menu_VIDEO_STATE" => &[("VIDEO_STATE", Menu("videoSensingVideoState"))],
        "wedo2_menu_MOTOR_ID" => &[("MOTOR_ID", Menu("wedo2MotorId"))],
        "wedo2_menu_MOTOR_DIRECTION" => &[("MOTOR_DIRECTION", Menu("wedo2MotorDirection"))],
        "wedo2_menu_TILT_DIRECTION" => &[("TILT_DIRECTION", Menu("wedo2TiltDirection"))],
        "wedo2_menu_TILT_DIRECTION_ANY" => {
            &[("TILT_DIRECTION_ANY", Menu("wedo2TiltDirectionAny"))]
        }
        "wedo2_menu_OP" => &[("OP", Menu("wedo2Op"))],
        _ => return None,
    };
    Some(table)
}

pub fn field_kind(opcode: &str, field: &str) -> Option<FieldKind> {
    field_types(opcode)?
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, kind)| *kind)
}

/// Whether `input` of `opcode` holds a statement stack rather than a single expression.
pub fn is_statement_slot(opcode: &str, input: &str) -> bool {
    match opcode {
        "control_if_else" => matches!(input, "SUBSTACK" | "SUBSTACK2"),
        "control_repeat"
        | "control_forever"
        | "control_if"
        | "control_repeat_until"
        | "control_while"
        | "control_for_each"
        | "control_all_at_once" => input == "SUBSTACK",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_cover_the_schema_range() {
        assert_eq!(InputStatus::from_code(4), Some(InputStatus::MathNumber));
        assert_eq!(InputStatus::from_code(13), Some(InputStatus::List));
        assert_eq!(InputStatus::from_code(0), None);
        assert_eq!(InputStatus::from_code(14), None);
    }

    #[test]
    fn color_param_menu_keeps_lowercase_field() {
        assert_eq!(
            field_kind("pen_menu_colorParam", "colorParam"),
            Some(FieldKind::Menu("penColorParam"))
        );
        assert_eq!(field_kind("pen_menu_colorParam", "COLOR_PARAM"), None);
    }

    #[test]
    fn statement_slots() {
        assert!(is_statement_slot("control_if_else", "SUBSTACK2"));
        assert!(is_statement_slot("control_forever", "SUBSTACK"));
        assert!(!is_statement_slot("control_if", "CONDITION"));
        assert!(!is_statement_slot("motion_movesteps", "SUBSTACK"));
    }
}
