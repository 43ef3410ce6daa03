use crate::Map;

/// A weighted reference from an exe to one of its maps.
///
/// `prob` is the probability that the map is actually touched when the exe
/// runs. New observations start at 1.0; the value is refined only by the
/// persisted model.
#[derive(Debug, Clone)]
pub struct ExeMap {
    pub map: Map,
    pub prob: f64,
}

impl ExeMap {
    pub fn new(map: Map) -> Self {
        Self { map, prob: 1.0 }
    }

    pub fn with_prob(mut self, prob: f64) -> Self {
        self.prob = prob;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_exemap_prob_is_one() {
        let exemap = ExeMap::new(Map::new("/usr/lib/libz.so", 0, 8192, 0));
        assert_eq!(exemap.prob, 1.0);
    }
}
