//! File naming for a model's artifacts.

/// Every file a model owns on the persistent store, derived from its name.
///
/// ```text
/// /<name>_base.bin        base sample store
/// /<name>_train.bin       session temp: training split
/// /<name>_test.bin        session temp: test split
/// /<name>_valid.bin       session temp: validation split
/// /<name>_tree_<i>.bin    one file per tree
/// /<name>_forest.bin      unified forest file
/// /<name>_config.json     hyperparameters
/// /<name>_node_pred.bin   node-count predictor
/// /<name>_node_log.csv    node-count predictor rolling log
/// /<name>_infer_log.bin   inference log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    name: String,
}

impl ModelPaths {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_data(&self) -> String {
        format!("/{}_base.bin", self.name)
    }

    pub fn train_data(&self) -> String {
        format!("/{}_train.bin", self.name)
    }

    pub fn test_data(&self) -> String {
        format!("/{}_test.bin", self.name)
    }

    pub fn valid_data(&self) -> String {
        format!("/{}_valid.bin", self.name)
    }

    pub fn tree(&self, index: usize) -> String {
        format!("/{}_tree_{}.bin", self.name, index)
    }

    pub fn forest(&self) -> String {
        format!("/{}_forest.bin", self.name)
    }

    pub fn config(&self) -> String {
        format!("/{}_config.json", self.name)
    }

    pub fn node_predictor(&self) -> String {
        format!("/{}_node_pred.bin", self.name)
    }

    pub fn node_log(&self) -> String {
        format!("/{}_node_log.csv", self.name)
    }

    pub fn infer_log(&self) -> String {
        format!("/{}_infer_log.bin", self.name)
    }
}
