use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub unique_value_proposition: Option<String>,
    #[serde(default)]
    pub pain_points: Option<String>,
    #[serde(default)]
    pub brand_voice: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The descriptive part of a profile, as carried in generation requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileContext {
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub unique_value_proposition: Option<String>,
    #[serde(default)]
    pub pain_points: Option<String>,
    #[serde(default)]
    pub brand_voice: Option<String>,
}

impl ProfileContext {
    /// `Label: value` lines for the fields that are present, in prompt order.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Business Name: {}", self.name)];
        let optional = [
            ("Industry", &self.industry),
            ("Target Audience", &self.target_audience),
            ("Unique Value Proposition", &self.unique_value_proposition),
            ("Pain Points", &self.pain_points),
            ("Brand Voice", &self.brand_voice),
        ];
        for (label, value) in optional {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                lines.push(format!("{}: {}", label, v));
            }
        }
        lines
    }
}

impl From<&BusinessProfile> for ProfileContext {
    fn from(p: &BusinessProfile) -> Self {
        Self {
            name: p.name.clone(),
            industry: p.industry.clone(),
            target_audience: p.target_audience.clone(),
            unique_value_proposition: p.unique_value_proposition.clone(),
            pain_points: p.pain_points.clone(),
            brand_voice: p.brand_voice.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewBusinessProfile {
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub target_audience: Option<String>,
    #[serde(default)]
    pub unique_value_proposition: Option<String>,
    #[serde(default)]
    pub pain_points: Option<String>,
    #[serde(default)]
    pub brand_voice: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

impl NewBusinessProfile {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_value_proposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pain_points: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand_voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

impl BusinessProfileUpdate {
    pub fn apply_to(&self, profile: &mut BusinessProfile) {
        if let Some(name) = &self.name {
            profile.name = name.clone();
        }
        if let Some(v) = &self.industry {
            profile.industry = Some(v.clone());
        }
        if let Some(v) = &self.target_audience {
            profile.target_audience = Some(v.clone());
        }
        if let Some(v) = &self.unique_value_proposition {
            profile.unique_value_proposition = Some(v.clone());
        }
        if let Some(v) = &self.pain_points {
            profile.pain_points = Some(v.clone());
        }
        if let Some(v) = &self.brand_voice {
            profile.brand_voice = Some(v.clone());
        }
        if let Some(is_default) = self.is_default {
            profile.is_default = is_default;
        }
    }
}
