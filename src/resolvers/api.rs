//! ST-021: API family — expand a path/method tree into gateway resources.
//!
//! One declaration produces the RestApi container, one resource per
//! authorizer, model, request validator, path segment and method, and a
//! deployment whose logical id carries a digest of everything else so that
//! any shape change forces a redeploy.

use super::{rewrite_reference_call, slugify, SymbolTable, Target};
use crate::core::dispatch::Resolver;
use crate::core::error::{ExpandError, Result};
use crate::core::fragment::FragmentCompiler;
use crate::core::hasher;
use crate::core::tree::{as_str, extract_key, into_mapping, map_keys, take_key};
use crate::core::types::*;
use crate::grammar::api::{self as grammar, normalize_path, ApiRef, ApiTarget, ValidatorMode};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const PATH_SIGIL: char = '/';
pub const METHOD_SIGIL: char = '$';

const REST_API: &str = "AWS::ApiGateway::RestApi";
const AUTHORIZER: &str = "AWS::ApiGateway::Authorizer";
const MODEL: &str = "AWS::ApiGateway::Model";
const VALIDATOR: &str = "AWS::ApiGateway::RequestValidator";
const RESOURCE: &str = "AWS::ApiGateway::Resource";
const METHOD: &str = "AWS::ApiGateway::Method";
const DEPLOYMENT: &str = "AWS::ApiGateway::Deployment";

const ROOT_PATH: &str = "/";
const ROOT_RESOURCE_ATTR: &str = "RootResourceId";
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const LAMBDA_AUTHORIZER_URI: &str =
    "arn:${AWS::Partition}:apigateway:${AWS::Region}:lambda:path/2015-03-31/functions/${FunctionArn}/invocations";

/// Symbol table for one declared API.
#[derive(Debug, Default)]
struct ApiRegistry {
    api_id: String,
    /// name → (logical id, authorizer type)
    authorizers: HashMap<String, (String, String)>,
    /// name → (logical id, content type)
    models: HashMap<String, (String, String)>,
    validators: BTreeMap<ValidatorMode, String>,
    /// decoded path → logical id; the root path is absent
    resources: HashMap<String, String>,
    methods: HashMap<(String, String), String>,
    deployment: Option<String>,
    used_ids: HashSet<String>,
}

impl ApiRegistry {
    /// Claim a collision-free logical id derived from `base`.
    fn claim(&mut self, base: String) -> String {
        let mut id = base;
        while self.used_ids.contains(&id) {
            id.push('_');
        }
        self.used_ids.insert(id.clone());
        id
    }

    fn lookup(&self, reference: &ApiRef, text: &str) -> Result<Target> {
        let missing = |what: String| ExpandError::unknown(text, what);
        let target = match reference.target {
            ApiTarget::Container => Target::resource(&self.api_id),
            ApiTarget::Authorizer(ref name) => self
                .authorizers
                .get(name)
                .map(|(id, _)| Target::resource(id))
                .ok_or_else(|| missing(format!("no authorizer '{}'", name)))?,
            ApiTarget::Model(ref name) => self
                .models
                .get(name)
                .map(|(id, _)| Target::resource(id))
                .ok_or_else(|| missing(format!("no model '{}'", name)))?,
            ApiTarget::Validator(mode) => self
                .validators
                .get(&mode)
                .map(Target::resource)
                .ok_or_else(|| missing(format!("no '{}' validator is in use", mode)))?,
            ApiTarget::Resource(ref path) if path == ROOT_PATH => {
                Target::attribute(&self.api_id, ROOT_RESOURCE_ATTR)
            }
            ApiTarget::Resource(ref path) => self
                .resources
                .get(path)
                .map(Target::resource)
                .ok_or_else(|| missing(format!("no resource at path '{}'", path)))?,
            ApiTarget::Method { ref path, ref verb } => self
                .methods
                .get(&(path.clone(), verb.clone()))
                .map(Target::resource)
                .ok_or_else(|| missing(format!("no method {} {}", verb, path)))?,
            ApiTarget::Deployment => self
                .deployment
                .as_ref()
                .map(Target::resource)
                .ok_or_else(|| missing("deployment not generated yet".to_string()))?,
        };
        Ok(target.with_suffix(reference.suffix.clone()))
    }
}

/// Expands API declarations and resolves `RestApi:` references.
#[derive(Debug)]
pub struct ApiResolver {
    apis: IndexMap<String, ApiRegistry>,
    hash_len: usize,
}

impl ApiResolver {
    pub fn new(hash_len: usize) -> Self {
        Self {
            apis: IndexMap::new(),
            hash_len,
        }
    }

    /// Number of APIs expanded so far.
    pub fn api_count(&self) -> usize {
        self.apis.len()
    }

    /// Expand a whole section (`{ApiId: declaration}`) into definitions.
    pub fn expand_section(&mut self, section: Node) -> Result<Vec<ResourceDefinition>> {
        let Value::Object(apis) = section else {
            return Err(ExpandError::malformed("API section", "must be a mapping of API ids"));
        };
        let mut definitions = Vec::new();
        for (api_id, decl) in apis {
            if slugify(&api_id) != api_id || api_id.is_empty() {
                return Err(ExpandError::malformed(
                    format!("API '{}'", api_id),
                    "id must be alphanumeric and start with an uppercase letter or digit",
                ));
            }
            if self.apis.contains_key(&api_id) {
                return Err(ExpandError::DuplicateLogicalId(api_id));
            }
            let (registry, defs) = ApiBuilder::new(&api_id, self.hash_len).build(decl)?;
            tracing::debug!(api = %api_id, resources = defs.len(), "expanded API");
            self.apis.insert(api_id, registry);
            definitions.extend(defs);
        }
        Ok(definitions)
    }
}

impl SymbolTable for ApiResolver {
    fn owns(&self, text: &str) -> bool {
        grammar::matches(text)
    }

    fn lookup(&self, text: &str) -> Result<Target> {
        let reference = ApiRef::parse(text)?;
        let registry = self
            .apis
            .get(&reference.api_id)
            .ok_or_else(|| ExpandError::unknown(text, format!("no API '{}'", reference.api_id)))?;
        let target = registry.lookup(&reference, text)?;
        tracing::trace!(reference = %text, id = %target.id, "resolved API reference");
        Ok(target)
    }
}

impl Resolver for ApiResolver {
    fn name(&self) -> &'static str {
        "api"
    }

    fn can_handle(&self, call: &str) -> bool {
        matches!(call, REF | GET_ATT | SUB)
    }

    fn expand(&self, call: &str, arg: Node) -> Result<Node> {
        rewrite_reference_call(self, call, arg)
    }
}

// ============================================================================
// Expansion of one API declaration
// ============================================================================

struct ApiBuilder {
    registry: ApiRegistry,
    definitions: Vec<ResourceDefinition>,
    compiler: FragmentCompiler,
    hash_len: usize,
}

impl ApiBuilder {
    fn new(api_id: &str, hash_len: usize) -> Self {
        let mut registry = ApiRegistry {
            api_id: api_id.to_string(),
            ..ApiRegistry::default()
        };
        registry.claim(api_id.to_string());
        Self {
            registry,
            definitions: Vec::new(),
            compiler: FragmentCompiler::new(),
            hash_len,
        }
    }

    fn context(&self) -> String {
        format!("API '{}'", self.registry.api_id)
    }

    fn api_ref(&self) -> Node {
        ref_to(&self.registry.api_id)
    }

    fn build(mut self, decl: Node) -> Result<(ApiRegistry, Vec<ResourceDefinition>)> {
        if !decl.is_object() {
            return Err(ExpandError::malformed(self.context(), "declaration must be a mapping"));
        }
        let decl = into_mapping(decl);

        let mut condition = None;
        let mut authorizers = None;
        let mut models = None;
        let mut validators = None;
        let mut deployment = None;
        let decl = extract_key(decl, "Condition", None, |v| {
            condition = as_str(&v).map(str::to_string);
            Ok(())
        })?;
        let decl = extract_key(decl, "Authorizers", None, |v| {
            authorizers = Some(v);
            Ok(())
        })?;
        let decl = extract_key(decl, "Models", None, |v| {
            models = Some(v);
            Ok(())
        })?;
        let decl = extract_key(decl, "Validators", None, |v| {
            validators = Some(v);
            Ok(())
        })?;
        let decl = extract_key(decl, "Deployment", Some(Value::Object(Mapping::new())), |v| {
            deployment = Some(v);
            Ok(())
        })?;

        let mut tree = Mapping::new();
        let mut container_props = Mapping::new();
        for (key, value) in decl {
            if key.starts_with(PATH_SIGIL) || key.starts_with(METHOD_SIGIL) {
                tree.insert(key, value);
            } else {
                container_props.insert(key, value);
            }
        }
        container_props
            .entry("Name")
            .or_insert_with(|| Value::String(self.registry.api_id.clone()));
        self.definitions
            .push(ResourceDefinition::new(&self.registry.api_id, REST_API).with_properties(container_props));

        if let Some(authorizers) = authorizers {
            self.build_authorizers(authorizers)?;
        }
        if let Some(models) = models {
            self.build_models(models)?;
        }
        if let Some(validators) = validators {
            self.build_declared_validators(validators)?;
        }
        self.build_tree(ROOT_PATH, None, tree)?;

        for def in &mut self.definitions {
            def.condition.clone_from(&condition);
        }
        self.build_deployment(deployment.unwrap_or_default(), condition)?;
        Ok((self.registry, self.definitions))
    }

    fn build_authorizers(&mut self, authorizers: Node) -> Result<()> {
        let Value::Object(authorizers) = authorizers else {
            return Err(ExpandError::malformed(self.context(), "Authorizers must be a mapping"));
        };
        for (name, body) in authorizers {
            let id = self.registry.claim(format!("{}{}Authorizer", self.registry.api_id, slugify(&name)));
            let (function_arn, mut props) = take_key(into_mapping(body), "FunctionArn");
            if props.get("Type").is_none() {
                let default_type = if props.contains_key("ProviderARNs") {
                    "COGNITO_USER_POOLS"
                } else {
                    "TOKEN"
                };
                props.insert("Type".into(), Value::String(default_type.to_string()));
            }
            if let Some(arn) = function_arn {
                let mut bindings = Mapping::new();
                bindings.insert("FunctionArn".into(), arn);
                props.insert(
                    "AuthorizerUri".into(),
                    call(
                        SUB,
                        Value::Array(vec![Value::String(LAMBDA_AUTHORIZER_URI.into()), Value::Object(bindings)]),
                    ),
                );
            }
            props.entry("Name").or_insert_with(|| Value::String(name.clone()));
            props.insert("RestApiId".into(), self.api_ref());
            let auth_type = props.get("Type").and_then(as_str).unwrap_or("TOKEN").to_string();
            self.registry.authorizers.insert(name, (id.clone(), auth_type));
            self.definitions
                .push(ResourceDefinition::new(id, AUTHORIZER).with_properties(props));
        }
        Ok(())
    }

    fn build_models(&mut self, models: Node) -> Result<()> {
        let Value::Object(models) = models else {
            return Err(ExpandError::malformed(self.context(), "Models must be a mapping"));
        };
        for (name, body) in models {
            let id = self.registry.claim(format!("{}{}Model", self.registry.api_id, slugify(&name)));
            let compiler = &mut self.compiler;
            let mut props = map_keys(into_mapping(body), &["Schema"], |_, schema| {
                Ok(match schema {
                    Value::String(_) => schema,
                    structure => compiler.compile(&structure).into_node(),
                })
            })?;
            let content_type = props
                .entry("ContentType")
                .or_insert_with(|| Value::String(DEFAULT_CONTENT_TYPE.into()))
                .as_str()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string();
            props.entry("Name").or_insert_with(|| Value::String(slugify(&name)));
            props.insert("RestApiId".into(), self.api_ref());
            self.registry.models.insert(name, (id.clone(), content_type));
            self.definitions.push(ResourceDefinition::new(id, MODEL).with_properties(props));
        }
        Ok(())
    }

    fn build_declared_validators(&mut self, validators: Node) -> Result<()> {
        let Value::Array(modes) = validators else {
            return Err(ExpandError::malformed(self.context(), "Validators must be a list"));
        };
        for mode in modes {
            let mode = self.parse_validator(&mode)?;
            self.validator(mode);
        }
        Ok(())
    }

    fn parse_validator(&self, node: &Node) -> Result<ValidatorMode> {
        as_str(node).and_then(ValidatorMode::parse).ok_or_else(|| {
            ExpandError::malformed(
                self.context(),
                format!("validator must be body, params or all, got {}", node),
            )
        })
    }

    /// Memoized request validator for `mode`.
    fn validator(&mut self, mode: ValidatorMode) -> String {
        if let Some(id) = self.registry.validators.get(&mode) {
            return id.clone();
        }
        let id = self
            .registry
            .claim(format!("{}{}Validator", self.registry.api_id, mode.id_part()));
        let mut props = Mapping::new();
        props.insert("RestApiId".into(), self.api_ref());
        props.insert("ValidateRequestBody".into(), Value::Bool(mode.validates_body()));
        props.insert("ValidateRequestParameters".into(), Value::Bool(mode.validates_params()));
        self.registry.validators.insert(mode, id.clone());
        self.definitions
            .push(ResourceDefinition::new(&id, VALIDATOR).with_properties(props));
        id
    }

    /// Walk one level of the path tree. `parent` is `None` at the API root.
    fn build_tree(&mut self, path: &str, parent: Option<&str>, tree: Mapping) -> Result<()> {
        for (key, value) in tree {
            if key.starts_with(PATH_SIGIL) {
                let (child_path, child_id) = self.build_path(path, parent, &key)?;
                if !value.is_null() && !value.is_object() {
                    return Err(ExpandError::malformed(
                        self.context(),
                        format!("path '{}' must map to methods and sub-paths", child_path),
                    ));
                }
                self.build_tree(&child_path, child_id.as_deref(), into_mapping(value))?;
            } else if let Some(verb) = key.strip_prefix(METHOD_SIGIL) {
                self.build_method(path, parent, verb, value)?;
            } else {
                return Err(ExpandError::malformed(
                    self.context(),
                    format!(
                        "path-tree key '{}' under '{}' must start with '{}' or '{}'",
                        key, path, PATH_SIGIL, METHOD_SIGIL
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Register each segment of a (possibly multi-segment) path key.
    fn build_path(&mut self, path: &str, parent: Option<&str>, key: &str) -> Result<(String, Option<String>)> {
        let mut current_path = path.to_string();
        let mut current_id = parent.map(str::to_string);
        for segment in key.split(PATH_SIGIL).filter(|s| !s.is_empty()) {
            // `.` starts a reference suffix, so such a segment could never be looked up.
            if segment.contains('.') {
                return Err(ExpandError::malformed(
                    self.context(),
                    format!("path segment '{}' must not contain '.'", segment),
                ));
            }
            let full = normalize_path(&format!("{}/{}", current_path, segment));
            let id = match self.registry.resources.get(&full) {
                Some(existing) => existing.clone(),
                None => {
                    let prefix = current_id.clone().unwrap_or_else(|| self.registry.api_id.clone());
                    let id = self.registry.claim(format!("{}{}", prefix, slugify(segment)));
                    let mut props = Mapping::new();
                    props.insert("RestApiId".into(), self.api_ref());
                    props.insert("ParentId".into(), self.resource_ref(current_id.as_deref()));
                    props.insert("PathPart".into(), Value::String(segment.to_string()));
                    self.registry.resources.insert(full.clone(), id.clone());
                    self.definitions
                        .push(ResourceDefinition::new(&id, RESOURCE).with_properties(props));
                    id
                }
            };
            current_path = full;
            current_id = Some(id);
        }
        Ok((current_path, current_id))
    }

    fn resource_ref(&self, id: Option<&str>) -> Node {
        match id {
            Some(id) => ref_to(id),
            None => get_att(&self.registry.api_id, ROOT_RESOURCE_ATTR),
        }
    }

    fn build_method(&mut self, path: &str, resource: Option<&str>, verb: &str, body: Node) -> Result<()> {
        let verb = verb.to_ascii_uppercase();
        if verb.is_empty() {
            return Err(ExpandError::malformed(self.context(), format!("empty method key under '{}'", path)));
        }
        let key = (path.to_string(), verb.clone());
        if self.registry.methods.contains_key(&key) {
            return Err(ExpandError::malformed(
                self.context(),
                format!("method {} {} declared twice", verb, path),
            ));
        }
        let prefix = resource.unwrap_or(&self.registry.api_id).to_string();
        let id = self.registry.claim(format!("{}{}", prefix, slugify(&verb)));

        let (authorizer, props) = take_key(into_mapping(body), "Authorizer");
        let (validate, props) = take_key(props, "Validate");
        let (model, mut props) = take_key(props, "Model");

        if let Some(name) = authorizer {
            let name = as_str(&name).unwrap_or_default().to_string();
            let (auth_id, auth_type) = self.registry.authorizers.get(&name).cloned().ok_or_else(|| {
                ExpandError::unknown(
                    format!("{} {} Authorizer '{}'", verb, path, name),
                    format!("no authorizer '{}' in {}", name, self.context()),
                )
            })?;
            props.insert("AuthorizerId".into(), ref_to(&auth_id));
            let authorization = if auth_type == "COGNITO_USER_POOLS" {
                "COGNITO_USER_POOLS"
            } else {
                "CUSTOM"
            };
            props
                .entry("AuthorizationType")
                .or_insert_with(|| Value::String(authorization.into()));
        }
        props
            .entry("AuthorizationType")
            .or_insert_with(|| Value::String("NONE".into()));

        if let Some(mode) = validate {
            let mode = self.parse_validator(&mode)?;
            let validator_id = self.validator(mode);
            props.insert("RequestValidatorId".into(), ref_to(&validator_id));
        }

        if let Some(name) = model {
            let name = as_str(&name).unwrap_or_default().to_string();
            let (model_id, content_type) = self.registry.models.get(&name).cloned().ok_or_else(|| {
                ExpandError::unknown(
                    format!("{} {} Model '{}'", verb, path, name),
                    format!("no model '{}' in {}", name, self.context()),
                )
            })?;
            let models = props
                .entry("RequestModels")
                .or_insert_with(|| Value::Object(Mapping::new()));
            if let Value::Object(models) = models {
                models.insert(content_type, ref_to(&model_id));
            }
        }

        let compiler = &mut self.compiler;
        let mut props = map_keys(props, &["Integration"], |_, integration| {
            compile_integration_templates(compiler, integration)
        })?;
        props.insert("HttpMethod".into(), Value::String(verb.clone()));
        props.insert("ResourceId".into(), self.resource_ref(resource));
        props.insert("RestApiId".into(), self.api_ref());

        self.registry.methods.insert(key, id.clone());
        self.definitions.push(ResourceDefinition::new(id, METHOD).with_properties(props));
        Ok(())
    }

    fn build_deployment(&mut self, deployment: Node, condition: Option<String>) -> Result<()> {
        if !deployment.is_object() {
            return Err(ExpandError::malformed(self.context(), "Deployment must be a mapping"));
        }
        let suffix = hasher::deployment_suffix(&self.definitions, self.hash_len);
        let id = self
            .registry
            .claim(format!("{}Deployment{}", self.registry.api_id, suffix));
        let mut props = into_mapping(deployment);
        props.insert("RestApiId".into(), self.api_ref());

        let mut def = ResourceDefinition::new(&id, DEPLOYMENT)
            .with_properties(props)
            .with_condition(condition);
        let mut methods: Vec<&String> = self.registry.methods.values().collect();
        methods.sort();
        def.depends_on.extend(methods.into_iter().cloned());

        self.registry.deployment = Some(id);
        self.definitions.push(def);
        Ok(())
    }
}

/// Compile structured request/response templates into strings.
fn compile_integration_templates(compiler: &mut FragmentCompiler, integration: Node) -> Result<Node> {
    let Value::Object(integration) = integration else {
        return Ok(integration);
    };
    let integration = map_keys(integration, &["RequestTemplates"], |_, templates| {
        Ok(compile_template_map(compiler, templates))
    })?;
    let integration = map_keys(integration, &["IntegrationResponses"], |_, responses| {
        Ok(match responses {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(mut response) => {
                            if let Some(templates) = response.get_mut("ResponseTemplates") {
                                let taken = std::mem::take(templates);
                                *templates = compile_template_map(compiler, taken);
                            }
                            Value::Object(response)
                        }
                        other => other,
                    })
                    .collect(),
            ),
            other => other,
        })
    })?;
    Ok(Value::Object(integration))
}

fn compile_template_map(compiler: &mut FragmentCompiler, templates: Node) -> Node {
    match templates {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(content_type, template)| {
                    let compiled = match template {
                        Value::String(_) => template,
                        structure => compiler.compile(&structure).into_node(),
                    };
                    (content_type, compiled)
                })
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expand(decl: Node) -> (ApiResolver, Vec<ResourceDefinition>) {
        let mut resolver = ApiResolver::new(10);
        let defs = resolver.expand_section(json!({ "Api": decl })).unwrap();
        (resolver, defs)
    }

    fn find<'a>(defs: &'a [ResourceDefinition], id: &str) -> &'a ResourceDefinition {
        defs.iter()
            .find(|d| d.id == id)
            .unwrap_or_else(|| panic!("no definition '{}' in {:?}", id, defs.iter().map(|d| &d.id).collect::<Vec<_>>()))
    }

    fn sample() -> Node {
        json!({
            "Description": "sample",
            "Authorizers": {
                "Cognito": {"ProviderARNs": ["arn:pool"], "IdentitySource": "method.request.header.Authorization"},
                "Lambda": {"FunctionArn": {"Fn::GetAtt": ["AuthFn", "Arn"]}}
            },
            "Models": {
                "User": {"Schema": {"type": "object", "title": {"Ref": "Title"}}}
            },
            "/users": {
                "$get": {"Authorizer": "Cognito", "Integration": {"Type": "MOCK"}},
                "$post": {"Validate": "body", "Model": "User"},
                "/{id}": {
                    "$GET": {"Authorizer": "Lambda", "Validate": "body"}
                }
            },
            "$ANY": {}
        })
    }

    #[test]
    fn test_st021_generates_family() {
        let (_, defs) = expand(sample());
        let container = find(&defs, "Api");
        assert_eq!(container.resource_type, REST_API);
        assert_eq!(container.properties["Name"], json!("Api"));
        assert_eq!(container.properties["Description"], json!("sample"));

        assert_eq!(find(&defs, "ApiCognitoAuthorizer").properties["Type"], json!("COGNITO_USER_POOLS"));
        assert_eq!(find(&defs, "ApiLambdaAuthorizer").properties["Type"], json!("TOKEN"));
        assert_eq!(find(&defs, "ApiUserModel").resource_type, MODEL);
        assert_eq!(find(&defs, "ApiUsers").properties["PathPart"], json!("users"));
        assert_eq!(
            find(&defs, "ApiUsers").properties["ParentId"],
            json!({"Fn::GetAtt": ["Api", "RootResourceId"]})
        );
        assert_eq!(find(&defs, "ApiUsersId").properties["ParentId"], json!({"Ref": "ApiUsers"}));
        assert_eq!(find(&defs, "ApiUsersGET").properties["HttpMethod"], json!("GET"));
        assert_eq!(find(&defs, "ApiUsersPOST").resource_type, METHOD);
        assert_eq!(find(&defs, "ApiUsersIdGET").resource_type, METHOD);
        assert_eq!(
            find(&defs, "ApiANY").properties["ResourceId"],
            json!({"Fn::GetAtt": ["Api", "RootResourceId"]})
        );
        let deployments: Vec<_> = defs.iter().filter(|d| d.resource_type == DEPLOYMENT).collect();
        assert_eq!(deployments.len(), 1);
        assert!(deployments[0].id.starts_with("ApiDeployment"));
        assert_eq!(deployments[0].id.len(), "ApiDeployment".len() + 10);
    }

    #[test]
    fn test_st021_method_wiring() {
        let (_, defs) = expand(sample());
        let get = find(&defs, "ApiUsersGET");
        assert_eq!(get.properties["AuthorizerId"], json!({"Ref": "ApiCognitoAuthorizer"}));
        assert_eq!(get.properties["AuthorizationType"], json!("COGNITO_USER_POOLS"));

        let by_id = find(&defs, "ApiUsersIdGET");
        assert_eq!(by_id.properties["AuthorizationType"], json!("CUSTOM"));

        let post = find(&defs, "ApiUsersPOST");
        assert_eq!(post.properties["AuthorizationType"], json!("NONE"));
        assert_eq!(post.properties["RequestValidatorId"], json!({"Ref": "ApiBodyValidator"}));
        assert_eq!(
            post.properties["RequestModels"],
            json!({"application/json": {"Ref": "ApiUserModel"}})
        );
    }

    #[test]
    fn test_st021_validator_memoized() {
        let (_, defs) = expand(sample());
        let validators: Vec<_> = defs.iter().filter(|d| d.resource_type == VALIDATOR).collect();
        assert_eq!(validators.len(), 1);
        assert_eq!(validators[0].properties["ValidateRequestBody"], json!(true));
        assert_eq!(validators[0].properties["ValidateRequestParameters"], json!(false));
    }

    #[test]
    fn test_st021_model_schema_compiled() {
        let (_, defs) = expand(sample());
        let schema = &find(&defs, "ApiUserModel").properties["Schema"];
        assert_eq!(schema, &json!({"Fn::Sub": r#"{"type":"object","title":"${Title}"}"#}));
    }

    #[test]
    fn test_st021_authorizer_uri_from_function() {
        let (_, defs) = expand(sample());
        let uri = &find(&defs, "ApiLambdaAuthorizer").properties["AuthorizerUri"];
        assert_eq!(uri["Fn::Sub"][1]["FunctionArn"], json!({"Fn::GetAtt": ["AuthFn", "Arn"]}));
        assert!(find(&defs, "ApiLambdaAuthorizer").properties.get("FunctionArn").is_none());
    }

    #[test]
    fn test_st021_integration_templates_compiled() {
        let (_, defs) = expand(json!({
            "/items": {"$GET": {"Integration": {
                "Type": "AWS",
                "RequestTemplates": {"application/json": {"TableName": {"Ref": "Table"}}},
                "IntegrationResponses": [{"StatusCode": 200, "ResponseTemplates": {"application/json": "$input.body"}}]
            }}}
        }));
        let integration = &find(&defs, "ApiItemsGET").properties["Integration"];
        assert_eq!(
            integration["RequestTemplates"]["application/json"],
            json!({"Fn::Sub": r#"{"TableName":"${Table}"}"#})
        );
        assert_eq!(
            integration["IntegrationResponses"][0]["ResponseTemplates"]["application/json"],
            json!("$input.body")
        );
    }

    #[test]
    fn test_st021_sibling_slug_collision() {
        let (resolver, defs) = expand(json!({
            "/user-list": {"$GET": {}},
            "/userlist": {"$GET": {}}
        }));
        assert_eq!(find(&defs, "ApiUserlist").properties["PathPart"], json!("user-list"));
        assert_eq!(find(&defs, "ApiUserlist_").properties["PathPart"], json!("userlist"));
        assert_eq!(
            resolver.lookup("RestApi:Api:Resource/user-list").unwrap(),
            Target::resource("ApiUserlist")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Resource/userlist").unwrap(),
            Target::resource("ApiUserlist_")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Method/userlist/GET").unwrap(),
            Target::resource("ApiUserlist_GET")
        );
    }

    #[test]
    fn test_st021_multi_segment_key() {
        let (resolver, defs) = expand(json!({
            "/v1/users": {"$GET": {}},
            "/v1": {"/health": {"$GET": {}}}
        }));
        assert_eq!(defs.iter().filter(|d| d.resource_type == RESOURCE).count(), 3);
        assert_eq!(
            resolver.lookup("RestApi:Api:Resource/v1/health").unwrap(),
            Target::resource("ApiV1Health")
        );
    }

    #[test]
    fn test_st021_lookups() {
        let (resolver, defs) = expand(sample());
        let deployment = defs.iter().find(|d| d.resource_type == DEPLOYMENT).unwrap();
        assert_eq!(resolver.lookup("RestApi:Api").unwrap(), Target::resource("Api"));
        assert_eq!(
            resolver.lookup("RestApi:Api.RootResourceId").unwrap(),
            Target::attribute("Api", "RootResourceId")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Resource/users/%id%").unwrap(),
            Target::resource("ApiUsersId")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Resource/").unwrap(),
            Target::attribute("Api", "RootResourceId")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Authorizer/Cognito").unwrap(),
            Target::resource("ApiCognitoAuthorizer")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Validator/body").unwrap(),
            Target::resource("ApiBodyValidator")
        );
        assert_eq!(
            resolver.lookup("RestApi:Api:Deployment").unwrap(),
            Target::resource(deployment.id.clone())
        );
    }

    #[test]
    fn test_st021_unknown_lookups_fail() {
        let (resolver, _) = expand(sample());
        for text in [
            "RestApi:Other",
            "RestApi:Api:Resource/missing",
            "RestApi:Api:Method/users/DELETE",
            "RestApi:Api:Authorizer/Nope",
            "RestApi:Api:Validator/all",
            "RestApi:Api:Widget/x",
        ] {
            let err = resolver.lookup(text).unwrap_err();
            assert!(matches!(err, ExpandError::UnknownReference { .. }), "{}: {}", text, err);
        }
    }

    #[test]
    fn test_st021_bad_tree_key() {
        let mut resolver = ApiResolver::new(10);
        let err = resolver
            .expand_section(json!({"Api": {"/users": {"GET": {}}}}))
            .unwrap_err();
        assert!(err.to_string().contains("path-tree key 'GET'"));
    }

    #[test]
    fn test_st021_dotted_path_segment_rejected() {
        let mut resolver = ApiResolver::new(10);
        let err = resolver
            .expand_section(json!({"Api": {"/v1.0": {"$GET": {}}}}))
            .unwrap_err();
        assert!(matches!(err, ExpandError::Malformed { .. }));
        assert!(err.to_string().contains("path segment 'v1.0'"));
    }

    #[test]
    fn test_st021_unknown_authorizer_is_fatal() {
        let mut resolver = ApiResolver::new(10);
        let err = resolver
            .expand_section(json!({"Api": {"/a": {"$GET": {"Authorizer": "Ghost"}}}}))
            .unwrap_err();
        assert!(matches!(err, ExpandError::UnknownReference { .. }));
    }

    #[test]
    fn test_st021_condition_applied_everywhere() {
        let (_, defs) = expand(json!({"Condition": "IsProd", "/a": {"$GET": {}}}));
        assert!(defs.iter().all(|d| d.condition.as_deref() == Some("IsProd")));
    }

    #[test]
    fn test_st021_deployment_depends_on_methods() {
        let (_, defs) = expand(sample());
        let deployment = defs.iter().find(|d| d.resource_type == DEPLOYMENT).unwrap();
        assert!(deployment.depends_on.contains("ApiUsersGET"));
        assert!(deployment.depends_on.contains("ApiANY"));
        assert_eq!(deployment.depends_on.len(), 4);
    }

    #[test]
    fn test_st021_deployment_hash_stable_and_sensitive() {
        let deployment_id = |decl: Node| {
            let (_, defs) = expand(decl);
            defs.into_iter().find(|d| d.resource_type == DEPLOYMENT).unwrap().id
        };
        assert_eq!(deployment_id(sample()), deployment_id(sample()));
        let mut changed = sample();
        changed["/users"]["$get"]["Integration"]["Type"] = json!("HTTP");
        assert_ne!(deployment_id(sample()), deployment_id(changed));
    }

    #[test]
    fn test_st021_rewrite_calls() {
        let (resolver, _) = expand(sample());
        assert_eq!(
            resolver.expand(REF, json!("RestApi:Api:Resource/users")).unwrap(),
            json!({"Ref": "ApiUsers"})
        );
        assert_eq!(
            resolver.expand(SUB, json!("https://${RestApi:Api}.execute-api/${RestApi:Api:Method/users/GET}")).unwrap(),
            json!({"Fn::Sub": "https://${Api}.execute-api/${ApiUsersGET}"})
        );
        assert_eq!(
            resolver.expand(REF, json!("RestApi:Api.RootResourceId")).unwrap(),
            json!({"Fn::GetAtt": ["Api", "RootResourceId"]})
        );
    }

    #[test]
    fn test_st021_invalid_api_id() {
        let mut resolver = ApiResolver::new(10);
        assert!(resolver.expand_section(json!({"my-api": {}})).is_err());
        assert!(resolver.expand_section(json!(["Api"])).is_err());
    }
}
