use serde::{Deserialize, Serialize};

/// Token usage counters for one generation, or accumulated over a run.
///
/// `total_tokens` is carried explicitly because providers may report it
/// directly; when rebuilding from components use [`Usage::reconstructed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
        .reconstructed()
    }

    /// Sum of the counted components.
    pub fn counted_total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.reasoning_tokens + self.cached_input_tokens
    }

    /// Same counters with `total_tokens` rebuilt from the components.
    pub fn reconstructed(mut self) -> Self {
        self.total_tokens = self.counted_total();
        self
    }

    /// Component-wise addition.
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            reasoning_tokens: self.reasoning_tokens + other.reasoning_tokens,
            cached_input_tokens: self.cached_input_tokens + other.cached_input_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }

    /// Component-wise sum over any number of usages.
    pub fn sum<'a>(usages: impl IntoIterator<Item = &'a Usage>) -> Usage {
        usages
            .into_iter()
            .fold(Usage::default(), |acc, u| acc.add(u))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, reasoning: u64, cached: u64) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            reasoning_tokens: reasoning,
            cached_input_tokens: cached,
            total_tokens: 0,
        }
        .reconstructed()
    }

    #[test]
    fn new_reconstructs_total() {
        let u = Usage::new(10, 5);
        assert_eq!(u.total_tokens, 15);
    }

    #[test]
    fn add_is_component_wise() {
        let a = usage(10, 5, 2, 1);
        let b = usage(3, 4, 0, 7);
        let sum = a.add(&b);
        assert_eq!(sum.input_tokens, 13);
        assert_eq!(sum.output_tokens, 9);
        assert_eq!(sum.reasoning_tokens, 2);
        assert_eq!(sum.cached_input_tokens, 8);
        assert_eq!(sum.total_tokens, a.total_tokens + b.total_tokens);
    }

    #[test]
    fn sum_over_many() {
        let parts = vec![usage(1, 1, 0, 0), usage(2, 2, 2, 0), usage(3, 3, 0, 3)];
        let total = Usage::sum(&parts);
        assert_eq!(total.input_tokens, 6);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.reasoning_tokens, 2);
        assert_eq!(total.cached_input_tokens, 3);
        assert_eq!(total.counted_total(), 17);
    }

    #[test]
    fn sum_of_nothing_is_zero() {
        assert_eq!(Usage::sum(&[]), Usage::default());
    }

    #[test]
    fn provider_reported_total_survives_serde() {
        // A provider may report a total that disagrees with the components;
        // the carried value wins until explicitly reconstructed.
        let mut u = usage(10, 10, 0, 0);
        u.total_tokens = 999;
        let json = serde_json::to_string(&u).unwrap();
        let restored: Usage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.total_tokens, 999);
        assert_eq!(restored.reconstructed().total_tokens, 20);
    }
}
