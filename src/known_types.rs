//! The constructor table for scikit-learn / joblib model files.
//!
//! One row per (module, name) pair that may appear in a model pickle.
//! The table is closed: resolution misses fail the decode with the exact
//! pair, instead of fabricating a stand-in object. Rows are data, not
//! logic; alias rows map legacy or wrapper spellings onto a canonical
//! target, never by string normalization.

use crate::registry::{Strategy, TypeRegistry};

fn generic(reg: &mut TypeRegistry, module: &str, name: &str) {
    reg.register(module, name, Strategy::generic(module, name));
}

fn extension(reg: &mut TypeRegistry, module: &str, name: &str) {
    reg.register(module, name, Strategy::extension(module, name));
}

/// Build the registry covering the scikit-learn model ecosystem:
/// joblib array wrappers, the numpy reconstruction machinery, scipy
/// sparse matrices, the sklearn estimators and transformers, and the
/// sklearn_pandas / sklearn2pmml / xgboost companions.
pub fn sklearn_registry() -> TypeRegistry {
    let mut reg = TypeRegistry::new();

    // joblib array wrappers. Models dumped before sklearn 0.18 reference
    // the vendored copy under sklearn.externals; both spellings resolve
    // to the same canonical wrapper types.
    for module in ["joblib.numpy_pickle", "sklearn.externals.joblib.numpy_pickle"] {
        reg.register(
            module,
            "NumpyArrayWrapper",
            Strategy::ndarray("joblib.numpy_pickle", "NumpyArrayWrapper"),
        );
        reg.register(
            module,
            "NDArrayWrapper",
            Strategy::generic("joblib.numpy_pickle", "NDArrayWrapper"),
        );
    }

    // numpy reconstruction machinery
    extension(&mut reg, "numpy", "dtype");
    extension(&mut reg, "numpy", "ndarray");
    extension(&mut reg, "numpy.core", "_ufunc_reconstruct");
    extension(&mut reg, "numpy.core.multiarray", "_reconstruct");
    extension(&mut reg, "numpy.core.multiarray", "scalar");
    extension(&mut reg, "numpy.random", "__RandomState_ctor");

    // Python runtime helpers referenced from reconstruction states.
    // The copy_reg / __builtin__ spellings come from Python 2 picklers.
    extension(&mut reg, "copyreg", "_reconstructor");
    reg.register(
        "copy_reg",
        "_reconstructor",
        Strategy::extension("copyreg", "_reconstructor"),
    );
    for name in ["object", "set", "frozenset"] {
        extension(&mut reg, "builtins", name);
        reg.register("__builtin__", name, Strategy::extension("builtins", name));
    }

    // scipy
    generic(&mut reg, "scipy.sparse.csr", "csr_matrix");

    // sklearn.cluster
    generic(&mut reg, "sklearn.cluster.k_means_", "KMeans");
    generic(&mut reg, "sklearn.cluster.k_means_", "MiniBatchKMeans");

    // sklearn.decomposition
    generic(&mut reg, "sklearn.decomposition.incremental_pca", "IncrementalPCA");
    generic(&mut reg, "sklearn.decomposition.pca", "PCA");

    // sklearn.discriminant_analysis
    generic(&mut reg, "sklearn.discriminant_analysis", "LinearDiscriminantAnalysis");

    // sklearn.ensemble
    generic(&mut reg, "sklearn.ensemble.bagging", "BaggingClassifier");
    generic(&mut reg, "sklearn.ensemble.bagging", "BaggingRegressor");
    generic(&mut reg, "sklearn.ensemble.forest", "ExtraTreesClassifier");
    generic(&mut reg, "sklearn.ensemble.forest", "ExtraTreesRegressor");
    generic(&mut reg, "sklearn.ensemble.forest", "RandomForestClassifier");
    generic(&mut reg, "sklearn.ensemble.forest", "RandomForestRegressor");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "BinomialDeviance");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "ExponentialLoss");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "GradientBoostingClassifier");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "GradientBoostingRegressor");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "LogOddsEstimator");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "MeanEstimator");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "MultinomialDeviance");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "PriorProbabilityEstimator");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "QuantileEstimator");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "ScaledLogOddsEstimator");
    generic(&mut reg, "sklearn.ensemble.gradient_boosting", "ZeroEstimator");
    generic(&mut reg, "sklearn.ensemble.voting_classifier", "VotingClassifier");

    // sklearn.linear_model. CV variants carry the same fitted fields as
    // the base estimator, so they collapse onto it.
    generic(&mut reg, "sklearn.linear_model.base", "LinearRegression");
    generic(&mut reg, "sklearn.linear_model.coordinate_descent", "ElasticNet");
    reg.register(
        "sklearn.linear_model.coordinate_descent",
        "ElasticNetCV",
        Strategy::generic("sklearn.linear_model.coordinate_descent", "ElasticNet"),
    );
    generic(&mut reg, "sklearn.linear_model.coordinate_descent", "Lasso");
    reg.register(
        "sklearn.linear_model.coordinate_descent",
        "LassoCV",
        Strategy::generic("sklearn.linear_model.coordinate_descent", "Lasso"),
    );
    generic(&mut reg, "sklearn.linear_model.logistic", "LogisticRegression");
    reg.register(
        "sklearn.linear_model.logistic",
        "LogisticRegressionCV",
        Strategy::generic("sklearn.linear_model.logistic", "LogisticRegression"),
    );
    generic(&mut reg, "sklearn.linear_model.ridge", "Ridge");
    reg.register(
        "sklearn.linear_model.ridge",
        "RidgeCV",
        Strategy::generic("sklearn.linear_model.ridge", "Ridge"),
    );
    generic(&mut reg, "sklearn.linear_model.ridge", "RidgeClassifier");
    reg.register(
        "sklearn.linear_model.ridge",
        "RidgeClassifierCV",
        Strategy::generic("sklearn.linear_model.ridge", "RidgeClassifier"),
    );
    extension(&mut reg, "sklearn.linear_model.sgd_fast", "Hinge");
    extension(&mut reg, "sklearn.linear_model.sgd_fast", "Log");
    extension(&mut reg, "sklearn.linear_model.sgd_fast", "ModifiedHuber");
    extension(&mut reg, "sklearn.linear_model.sgd_fast", "SquaredHinge");
    generic(&mut reg, "sklearn.linear_model.stochastic_gradient", "SGDClassifier");
    generic(&mut reg, "sklearn.linear_model.stochastic_gradient", "SGDRegressor");

    // sklearn.naive_bayes
    generic(&mut reg, "sklearn.naive_bayes", "GaussianNB");

    // sklearn.neighbors. The compiled tree/metric types pickle through
    // module-level newObj factories.
    generic(&mut reg, "sklearn.neighbors.classification", "KNeighborsClassifier");
    reg.register(
        "sklearn.neighbors.dist_metrics",
        "newObj",
        Strategy::extension("sklearn.neighbors.dist_metrics", "DistanceMetric"),
    );
    reg.register(
        "sklearn.neighbors.kd_tree",
        "newObj",
        Strategy::extension("sklearn.neighbors.kd_tree", "BinaryTree"),
    );
    generic(&mut reg, "sklearn.neighbors.regression", "KNeighborsRegressor");

    // sklearn.neural_network
    generic(&mut reg, "sklearn.neural_network.multilayer_perceptron", "MLPClassifier");
    generic(&mut reg, "sklearn.neural_network.multilayer_perceptron", "MLPRegressor");

    // sklearn.preprocessing
    generic(&mut reg, "sklearn.preprocessing._function_transformer", "FunctionTransformer");
    generic(&mut reg, "sklearn.preprocessing.data", "Binarizer");
    generic(&mut reg, "sklearn.preprocessing.data", "MaxAbsScaler");
    generic(&mut reg, "sklearn.preprocessing.data", "MinMaxScaler");
    generic(&mut reg, "sklearn.preprocessing.data", "OneHotEncoder");
    generic(&mut reg, "sklearn.preprocessing.data", "RobustScaler");
    generic(&mut reg, "sklearn.preprocessing.data", "StandardScaler");
    generic(&mut reg, "sklearn.preprocessing.imputation", "Imputer");
    generic(&mut reg, "sklearn.preprocessing.label", "LabelBinarizer");
    generic(&mut reg, "sklearn.preprocessing.label", "LabelEncoder");

    // sklearn.svm
    generic(&mut reg, "sklearn.svm.classes", "LinearSVR");
    generic(&mut reg, "sklearn.svm.classes", "NuSVC");
    generic(&mut reg, "sklearn.svm.classes", "NuSVR");
    generic(&mut reg, "sklearn.svm.classes", "OneClassSVM");
    generic(&mut reg, "sklearn.svm.classes", "SVC");
    generic(&mut reg, "sklearn.svm.classes", "SVR");

    // sklearn.tree
    extension(&mut reg, "sklearn.tree._tree", "BestSplitter");
    extension(&mut reg, "sklearn.tree._tree", "ClassificationCriterion");
    extension(&mut reg, "sklearn.tree._tree", "PresortBestSplitter");
    extension(&mut reg, "sklearn.tree._tree", "RegressionCriterion");
    extension(&mut reg, "sklearn.tree._tree", "Tree");
    generic(&mut reg, "sklearn.tree.tree", "DecisionTreeClassifier");
    generic(&mut reg, "sklearn.tree.tree", "DecisionTreeRegressor");
    generic(&mut reg, "sklearn.tree.tree", "ExtraTreeClassifier");
    generic(&mut reg, "sklearn.tree.tree", "ExtraTreeRegressor");

    // sklearn_pandas moved DataFrameMapper into a submodule in 1.0
    generic(&mut reg, "sklearn_pandas", "DataFrameMapper");
    reg.register(
        "sklearn_pandas.dataframe_mapper",
        "DataFrameMapper",
        Strategy::generic("sklearn_pandas", "DataFrameMapper"),
    );
    generic(&mut reg, "sklearn_pandas.pipeline", "TransformerPipeline");

    // sklearn2pmml
    generic(&mut reg, "sklearn2pmml.decoration", "CategoricalDomain");
    generic(&mut reg, "sklearn2pmml.decoration", "ContinuousDomain");

    // xgboost
    generic(&mut reg, "xgboost.core", "Booster");
    generic(&mut reg, "xgboost.sklearn", "XGBClassifier");
    generic(&mut reg, "xgboost.sklearn", "XGBRegressor");

    reg
}
