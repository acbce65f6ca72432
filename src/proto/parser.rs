//! Parsers for Tesira Text Protocol responses

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag, take_until},
    character::complete::multispace0,
    multi::{many0, many1},
    sequence::{delimited, preceded, separated_pair},
};
use tracing::warn;

use super::{
    CMD_RESPONSE_OK, ErrResponse, OkBody, ParseError, Response, Update, UpdateValue, Value,
};

/// Pull every complete frame out of an accumulated receive buffer.
///
/// Consumes up to the last newline; a trailing partial line stays in the
/// buffer for the next round. Lines that do not start with one of the three
/// response prefixes are command echo or prompt noise and are dropped
/// silently; prefixed lines that fail to parse are dropped with a warning.
pub fn extract_frames(buffer: &mut String) -> Vec<Response> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if !line.starts_with(['+', '-', '!']) {
            continue;
        }
        match parse_response(line) {
            Ok(frame) => frames.push(frame),
            Err(e) => warn!("dropping unparseable response line {line:?}: {e}"),
        }
    }
    frames
}

/// Parse a single response line
pub fn parse_response(line: &str) -> Result<Response, ParseError> {
    let line = line.trim();
    if let Some(body) = line.strip_prefix("+OK") {
        ok_body(body).map(Response::Ok)
    } else if let Some(message) = line.strip_prefix("-ERR") {
        Ok(Response::Err(ErrResponse {
            message: message.trim().to_owned(),
        }))
    } else if let Some(body) = line.strip_prefix('!') {
        subscription(body).map(Response::Subscription)
    } else {
        Err(ParseError::Syntax(format!("unknown prefix: {line}")))
    }
}

/// Decode the remainder of a `+OK` line.
///
/// A body that is blank (quotes aside) is a bare acknowledgement. Otherwise
/// the body is `<type>:<payload>`; `value` and `list` payloads are decoded,
/// any other type is surfaced verbatim.
fn ok_body(body: &str) -> Result<OkBody, ParseError> {
    let body = body.trim();
    if body.replace('"', "").trim().is_empty() {
        return Ok(OkBody::Value(Value::Text(CMD_RESPONSE_OK.to_owned())));
    }

    let Some((data_type, payload)) = body.split_once(':') else {
        return Err(ParseError::Syntax(format!("untyped OK body: {body}")));
    };

    match data_type.replace('"', "").as_str() {
        "value" => Ok(OkBody::Value(Value::normalise(
            &payload.trim().replace('"', ""),
        ))),
        "list" => {
            let (_, items) = bracketed_list(payload.trim())
                .map_err(|e| ParseError::Syntax(format!("bad list payload: {e}")))?;
            Ok(OkBody::List(items))
        }
        other => {
            warn!("unknown OK response data type: {other} -> {body}");
            Ok(OkBody::Raw(body.to_owned()))
        }
    }
}

/// `[ "item1" "item2" ... ]`, quoted items extracted by matching quote pairs
fn bracketed_list(input: &str) -> IResult<&str, Vec<Value>> {
    delimited(
        tag("["),
        many0(preceded(
            take_until("\""),
            delimited(tag("\""), take_until("\""), tag("\"")),
        )),
        preceded(multispace0, tag("]")),
    )
    .map(|items: Vec<&str>| items.into_iter().map(Value::normalise).collect())
    .parse(input)
}

/// A key token: quoted, bracketed, or a bare word up to `:`/whitespace
fn pair_key(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(tag("\""), take_until("\""), tag("\"")),
        delimited(tag("["), take_until("]"), tag("]")),
        is_not(": \t\r\n"),
    ))
    .parse(input)
}

/// A value token: bracketed list, quoted string, or a bare word
fn pair_value(input: &str) -> IResult<&str, UpdateValue> {
    alt((
        delimited(tag("["), take_until("]"), tag("]")).map(|inner: &str| {
            UpdateValue::List(
                inner
                    .replace('"', "")
                    .split_whitespace()
                    .map(Value::normalise)
                    .collect(),
            )
        }),
        delimited(tag("\""), take_until("\""), tag("\""))
            .map(|inner: &str| UpdateValue::Scalar(Value::normalise(inner))),
        is_not(", \t\r\n").map(|word: &str| UpdateValue::Scalar(Value::normalise(word))),
    ))
    .parse(input)
}

/// The `key:value` pair sequence of a subscription line
fn pair_sequence(input: &str) -> IResult<&str, Vec<(&str, UpdateValue)>> {
    many1(preceded(
        multispace0,
        separated_pair(pair_key, tag(":"), pair_value),
    ))
    .parse(input)
}

/// Decode the remainder of a `!` line into a typed update.
///
/// Both `publishToken` and `value` are mandatory, and the token must be
/// `S_` followed by a 4-character tag, `_`, and the block ID.
fn subscription(body: &str) -> Result<Update, ParseError> {
    let body = body.trim();
    let (_, pairs) = pair_sequence(body)
        .map_err(|e| ParseError::Syntax(format!("bad subscription body: {e}")))?;

    let mut token = None;
    let mut value = None;
    for (key, val) in pairs {
        match key {
            "publishToken" => token = Some(val),
            "value" => value = Some(val),
            _ => {}
        }
    }

    let token = match token {
        Some(UpdateValue::Scalar(Value::Text(token))) => token,
        Some(_) => return Err(ParseError::MissingField("publishToken")),
        None => return Err(ParseError::MissingField("publishToken")),
    };
    let value = value.ok_or(ParseError::MissingField("value"))?;

    let (tag, block_id) = split_publish_token(&token)?;
    Ok(Update {
        tag: tag.to_owned(),
        block_id: block_id.to_owned(),
        value,
    })
}

/// Split `S_<TID>_<blockID>`; the TID is always 4 characters wide
fn split_publish_token(token: &str) -> Result<(&str, &str), ParseError> {
    let bad = || ParseError::BadPublishToken(token.to_owned());
    let rest = token.strip_prefix("S_").ok_or_else(bad)?;
    let (tid, block_id) = rest.split_once('_').ok_or_else(bad)?;
    if tid.len() != 4 || block_id.is_empty() {
        return Err(bad());
    }
    Ok((tid, block_id))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn should_parse_bare_ack() {
        assert_eq!(
            parse_response("+OK\r").unwrap(),
            Response::Ok(OkBody::Value(Value::Text(CMD_RESPONSE_OK.to_owned())))
        );
        assert_eq!(
            parse_response("+OK \"\"").unwrap(),
            Response::Ok(OkBody::Value(Value::Text(CMD_RESPONSE_OK.to_owned())))
        );
    }

    #[test]
    fn should_parse_scalar_values() {
        assert_eq!(
            parse_response("+OK \"value\":\"true\"").unwrap(),
            Response::Ok(OkBody::Value(Value::Boolean(true)))
        );
        assert_eq!(
            parse_response("+OK \"value\":-12.5").unwrap(),
            Response::Ok(OkBody::Value(Value::Number(-12.5)))
        );
        assert_eq!(
            parse_response("+OK \"value\":\"TesiraForte05953601\"").unwrap(),
            Response::Ok(OkBody::Value(Value::Text(
                "TesiraForte05953601".to_owned()
            )))
        );
    }

    #[test]
    fn should_parse_list_values() {
        assert_eq!(
            parse_response("+OK \"list\":[ \"Room_A\" \"Room_B\" \"Room_C\" ]").unwrap(),
            Response::Ok(OkBody::List(vec![
                Value::Text("Room_A".to_owned()),
                Value::Text("Room_B".to_owned()),
                Value::Text("Room_C".to_owned()),
            ]))
        );
    }

    #[test]
    fn should_surface_unknown_ok_types_verbatim() {
        assert_eq!(
            parse_response("+OK \"time\":12:56:43").unwrap(),
            Response::Ok(OkBody::Raw("\"time\":12:56:43".to_owned()))
        );
    }

    #[test]
    fn should_reject_untyped_ok_bodies() {
        assert!(matches!(
            parse_response("+OK gibberish"),
            Err(ParseError::Syntax(_))
        ));
    }

    #[test]
    fn should_parse_err() {
        assert_eq!(
            parse_response("-ERR address not found: {\"deviceId\":0}").unwrap(),
            Response::Err(ErrResponse {
                message: "address not found: {\"deviceId\":0}".to_owned()
            })
        );
        assert_eq!(
            parse_response("-ERR").unwrap(),
            Response::Err(ErrResponse {
                message: "".to_owned()
            })
        );
    }

    #[test]
    fn should_parse_multi_channel_subscription() {
        assert_eq!(
            parse_response("! \"publishToken\":\"S_LVLA_Gain1\" \"value\":[ -10 -10 -20 -20 ]")
                .unwrap(),
            Response::Subscription(Update {
                tag: "LVLA".to_owned(),
                block_id: "Gain1".to_owned(),
                value: UpdateValue::List(vec![
                    Value::Number(-10.0),
                    Value::Number(-10.0),
                    Value::Number(-20.0),
                    Value::Number(-20.0),
                ]),
            })
        );
    }

    #[test]
    fn should_parse_scalar_subscription() {
        assert_eq!(
            parse_response("! \"publishToken\":\"S_UCON_USB1\" \"value\":true").unwrap(),
            Response::Subscription(Update {
                tag: "UCON".to_owned(),
                block_id: "USB1".to_owned(),
                value: UpdateValue::Scalar(Value::Boolean(true)),
            })
        );
    }

    #[test]
    fn should_keep_underscores_in_block_ids() {
        assert_eq!(
            parse_response("! \"publishToken\":\"S_MUTA_Main_Mix 2\" \"value\":[ true false ]")
                .unwrap(),
            Response::Subscription(Update {
                tag: "MUTA".to_owned(),
                block_id: "Main_Mix 2".to_owned(),
                value: UpdateValue::List(vec![Value::Boolean(true), Value::Boolean(false)]),
            })
        );
    }

    #[test]
    fn should_reject_subscription_without_value() {
        assert!(matches!(
            parse_response("! \"publishToken\":\"S_LVLA_Gain1\""),
            Err(ParseError::MissingField("value"))
        ));
    }

    #[test]
    fn should_reject_subscription_without_token() {
        assert!(matches!(
            parse_response("! \"value\":[ 1 2 ]"),
            Err(ParseError::MissingField("publishToken"))
        ));
    }

    #[test]
    fn should_reject_malformed_publish_tokens() {
        for token in ["Subscription0", "S_LVL_Gain1", "S_LEVELS_Gain1", "S_LVLA_"] {
            let line = format!("! \"publishToken\":\"{token}\" \"value\":1");
            assert!(
                matches!(parse_response(&line), Err(ParseError::BadPublishToken(_))),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn should_extract_frames_and_skip_noise() {
        let mut buffer = String::new();
        buffer.push_str("Welcome to the Tesira Text Protocol Server...\r\n");
        buffer.push_str("DEVICE get hostname\r\n");
        buffer.push_str("+OK \"value\":\"forte\"\r\n");
        buffer.push_str("! \"publishToken\":\"S_UCON_USB1\" \"value\":false\r\n");
        buffer.push_str("+OK \"val");

        let frames = extract_frames(&mut buffer);
        assert_eq!(
            frames,
            vec![
                Response::Ok(OkBody::Value(Value::Text("forte".to_owned()))),
                Response::Subscription(Update {
                    tag: "UCON".to_owned(),
                    block_id: "USB1".to_owned(),
                    value: UpdateValue::Scalar(Value::Boolean(false)),
                }),
            ]
        );
        // partial tail stays buffered
        assert_eq!(buffer, "+OK \"val");
    }

    #[test]
    fn should_discard_lines_with_unknown_first_character() {
        let mut buffer = "hello\n#comment\n OK\n".to_owned();
        assert_eq!(extract_frames(&mut buffer), vec![]);
        assert_eq!(buffer, "");
    }
}
