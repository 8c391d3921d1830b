use super::{decode_json, ParseError, WireFormat};
use crate::model::Profile;

/// Profiling payload, passed through after decoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileFormat;

impl WireFormat for ProfileFormat {
    type Record = Profile;
    const NAME: &'static str = "profile";

    fn decode(buf: &[u8]) -> Result<Profile, ParseError> {
        let profile: Profile = decode_json(Self::NAME, buf)?;
        if profile.name.is_empty() {
            return Err(ParseError::MissingField { field: "name" });
        }
        Ok(profile)
    }
}
