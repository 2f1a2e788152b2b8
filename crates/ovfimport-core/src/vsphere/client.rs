//! Blocking vim25 client.

use std::time::Duration;

use reqwest::blocking::{Body, Client};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::api::{
    DeviceUrl, FileItem, ImportSpec, ImportSpecParams, LeaseInfo, LeaseState, LeaseStatus,
    ManagementApi, UploadBody,
};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::inventory::{
    Datacenter, Datastore, Folder, Inventory, InventoryObject, ManagedObjectReference, Network,
    ObjectKind, ResourcePool, VirtualMachine,
};

use super::soap::{self, call, element, fault_message, parse_response, reference, Node};

/// SOAP action header sent with every call.
const SOAP_ACTION: &str = "urn:vim25/6.5";

/// Content type for disk uploads.
const UPLOAD_CONTENT_TYPE: &str = "application/x-vnd.vmware-streamVmdk";

/// Default timeout for API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How to reach and authenticate against the platform.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server name or URL. A bare host gets `https://` and `/sdk`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// Timeout for API calls. Uploads only use it as a connect timeout.
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            insecure: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The SDK endpoint URL.
    pub fn sdk_url(&self) -> Result<Url> {
        let raw = self.url.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{}", raw)
        };
        let mut url = Url::parse(&with_scheme)
            .map_err(|e| Error::api(format!("invalid server URL '{}': {}", self.url, e)))?;
        if url.host_str().is_none() {
            return Err(Error::api(format!("server URL '{}' has no host", self.url)));
        }
        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/sdk");
        }
        Ok(url)
    }
}

/// Service content references used by the client.
#[derive(Debug, Clone)]
struct ServiceContent {
    root_folder: ManagedObjectReference,
    property_collector: ManagedObjectReference,
    search_index: ManagedObjectReference,
    view_manager: ManagedObjectReference,
    session_manager: ManagedObjectReference,
    ovf_manager: ManagedObjectReference,
    version: String,
}

impl ServiceContent {
    fn from_node(node: &Node) -> Result<Self> {
        let content = node
            .child("returnval")
            .ok_or_else(|| Error::api("RetrieveServiceContent returned nothing"))?;
        let field = |name: &str| {
            content
                .child(name)
                .and_then(Node::to_reference)
                .ok_or_else(|| Error::api(format!("service content has no {}", name)))
        };

        Ok(Self {
            root_folder: field("rootFolder")?,
            property_collector: field("propertyCollector")?,
            search_index: field("searchIndex")?,
            view_manager: field("viewManager")?,
            session_manager: field("sessionManager")?,
            ovf_manager: field("ovfManager")?,
            version: content
                .find(&["about", "version"])
                .map(|n| n.text().to_string())
                .ok_or_else(|| Error::api("service content has no version"))?,
        })
    }
}

/// One object returned by the property collector.
#[derive(Debug, Clone)]
struct ObjectContent {
    obj: ManagedObjectReference,
    props: Vec<(String, Node)>,
}

impl ObjectContent {
    fn prop(&self, name: &str) -> Option<&Node> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// A logged-in vim25 session.
pub struct VsphereClient {
    http: Client,
    transfer: Client,
    sdk_url: Url,
    content: ServiceContent,
    cookie: Option<String>,
}

impl std::fmt::Debug for VsphereClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereClient")
            .field("sdk_url", &self.sdk_url.as_str())
            .field("version", &self.content.version)
            .finish()
    }
}

impl VsphereClient {
    /// Connect and log in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the server cannot be reached or rejects the
    /// credentials.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let sdk_url = config.sdk_url()?;
        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| Error::api(format!("failed to build HTTP client: {}", e)))?;
        let transfer = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Option::<Duration>::None)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| Error::api(format!("failed to build HTTP client: {}", e)))?;

        let service_instance = ManagedObjectReference::new("ServiceInstance", "ServiceInstance");
        let (node, _) = send(
            &http,
            &sdk_url,
            None,
            &call("RetrieveServiceContent", &service_instance, ""),
        )?;
        let content = ServiceContent::from_node(&node)?;
        debug!(url = %sdk_url, version = %content.version, "connected");

        let mut client = Self {
            http,
            transfer,
            sdk_url,
            content,
            cookie: None,
        };
        client.login(&config.username, &config.password)?;
        Ok(client)
    }

    fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let params = format!(
            "{}{}",
            element("userName", username),
            element("password", password)
        );
        let body = call("Login", &self.content.session_manager, &params);
        let (_, cookie) = send(&self.http, &self.sdk_url, None, &body)?;
        self.cookie = Some(cookie.ok_or_else(|| Error::api("login returned no session cookie"))?);
        debug!(user = username, "logged in");
        Ok(())
    }

    /// End the session.
    pub fn logout(&self) -> Result<()> {
        self.invoke(&call("Logout", &self.content.session_manager, ""))?;
        debug!("logged out");
        Ok(())
    }

    /// The platform version reported at connect time.
    pub fn version(&self) -> &str {
        &self.content.version
    }

    fn invoke(&self, body: &str) -> Result<Node> {
        send(&self.http, &self.sdk_url, self.cookie.as_deref(), body).map(|(node, _)| node)
    }

    /// Fetch `paths` of every object selected by `object_set`.
    fn retrieve(&self, kind: &str, paths: &[&str], object_set: &str) -> Result<Vec<ObjectContent>> {
        let prop_set = format!(
            "<propSet>{}{}</propSet>",
            element("type", kind),
            paths.iter().map(|p| element("pathSet", p)).collect::<String>()
        );
        let params = format!(
            "<specSet>{}{}</specSet><options></options>",
            prop_set, object_set
        );

        let mut objects = Vec::new();
        let mut response = self.invoke(&call(
            "RetrievePropertiesEx",
            &self.content.property_collector,
            &params,
        ))?;
        loop {
            let Some(result) = response.child("returnval") else {
                break;
            };
            objects.extend(result.children_named("objects").filter_map(object_content));
            let Some(token) = result.child_text("token").map(str::to_string) else {
                break;
            };
            response = self.invoke(&call(
                "ContinueRetrievePropertiesEx",
                &self.content.property_collector,
                &element("token", &token),
            ))?;
        }
        Ok(objects)
    }

    fn retrieve_one(&self, obj: &ManagedObjectReference, paths: &[&str]) -> Result<ObjectContent> {
        let object_set = format!("<objectSet>{}</objectSet>", reference("obj", obj));
        self.retrieve(&obj.kind, paths, &object_set)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::api(format!("no properties returned for {}", obj)))
    }

    /// Fetch `paths` of every `kind` object under `container`, via a
    /// temporary container view.
    fn retrieve_in_container(
        &self,
        container: &ManagedObjectReference,
        kind: &str,
        paths: &[&str],
    ) -> Result<Vec<ObjectContent>> {
        let params = format!(
            "{}{}{}",
            reference("container", container),
            element("type", kind),
            element("recursive", "true")
        );
        let view = self
            .invoke(&call("CreateContainerView", &self.content.view_manager, &params))?
            .child("returnval")
            .and_then(Node::to_reference)
            .ok_or_else(|| Error::api("CreateContainerView returned no view"))?;

        let object_set = format!(
            concat!(
                "<objectSet>{}<skip>true</skip>",
                r#"<selectSet xsi:type="TraversalSpec"><name>traverseEntities</name>"#,
                "<type>ContainerView</type><path>view</path><skip>false</skip></selectSet>",
                "</objectSet>"
            ),
            reference("obj", &view)
        );
        let result = self.retrieve(kind, paths, &object_set);

        if let Err(e) = self.invoke(&call("DestroyView", &view, "")) {
            debug!(view = %view, error = %e, "failed to destroy container view");
        }
        result
    }

    fn lease_call(&self, method: &str, lease: &ManagedObjectReference, params: &str) -> Result<()> {
        self.invoke(&call(method, lease, params))?;
        debug!(lease = %lease, method, "lease call");
        Ok(())
    }

    /// Replace a `*` host in a device URL with the server host.
    fn device_url(&self, raw: &str) -> Result<Url> {
        let rewritten = match raw.find("://*") {
            Some(index) => {
                let host = self.sdk_url.host_str().unwrap_or_default();
                let rest = &raw[index + 4..];
                let authority = match self.sdk_url.port() {
                    Some(port) if !rest.starts_with(':') => format!("{}:{}", host, port),
                    _ => host.to_string(),
                };
                format!("{}://{}{}", &raw[..index], authority, rest)
            }
            None => raw.to_string(),
        };
        Url::parse(&rewritten).map_err(|e| Error::lease(format!("invalid device URL '{}': {}", raw, e)))
    }
}

/// POST a SOAP body and return the parsed result plus any session cookie.
fn send(
    http: &Client,
    url: &Url,
    cookie: Option<&str>,
    body: &str,
) -> Result<(Node, Option<String>)> {
    let mut request = http
        .post(url.clone())
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", SOAP_ACTION)
        .body(soap::envelope(body));
    if let Some(cookie) = cookie {
        request = request.header(COOKIE, cookie);
    }

    let response = request
        .send()
        .map_err(|e| Error::api(format!("request to {} failed: {}", url, e)))?;
    let status = response.status();
    let session = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_string());
    let text = response
        .text()
        .map_err(|e| Error::api(format!("failed to read response: {}", e)))?;

    // Faults arrive with a 500 status, so parse before checking it.
    match parse_response(&text) {
        Ok(node) if status.is_success() => Ok((node, session)),
        Ok(_) => Err(Error::api(format!("HTTP {}", status))),
        Err(e) if status.is_success() || text.contains("Fault") => Err(e),
        Err(_) => Err(Error::api(format!("HTTP {}", status))),
    }
}

fn object_content(node: &Node) -> Option<ObjectContent> {
    let obj = node.child("obj")?.to_reference()?;
    let props = node
        .children_named("propSet")
        .filter_map(|p| Some((p.child_text("name")?.to_string(), p.child("val")?.clone())))
        .collect();
    Some(ObjectContent { obj, props })
}

fn parse_bool(text: &str) -> bool {
    matches!(text, "true" | "1")
}

impl Inventory for VsphereClient {
    fn object_by_id(&self, kind: ObjectKind, id: &str) -> Result<InventoryObject> {
        let requested = ManagedObjectReference::new(kind.type_name(), id);
        let object = self
            .retrieve_one(&requested, &["name"])
            .map_err(|e| match e {
                Error::ObjectNotFound { .. } => Error::ObjectNotFound {
                    kind,
                    id: id.to_string(),
                },
                other => other,
            })?;
        let name = object.prop("name").map(|n| n.text().to_string());
        Ok(InventoryObject::from_reference(object.obj, name))
    }

    fn object_by_path(&self, path: &str) -> Result<InventoryObject> {
        if path.is_empty() {
            return Ok(InventoryObject::from_reference(
                self.content.root_folder.clone(),
                None,
            ));
        }
        let found = self
            .invoke(&call(
                "FindByInventoryPath",
                &self.content.search_index,
                &element("inventoryPath", path),
            ))?
            .child("returnval")
            .and_then(Node::to_reference)
            .ok_or_else(|| Error::api(format!("no object at inventory path '{}'", path)))?;
        let name = path.rsplit('/').next().map(str::to_string);
        Ok(InventoryObject::from_reference(found, name))
    }

    fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder> {
        let object = self.retrieve_one(datacenter.reference(), &["vmFolder"])?;
        let folder = object
            .prop("vmFolder")
            .and_then(Node::to_reference)
            .ok_or_else(|| Error::api(format!("{} has no vmFolder", datacenter.reference())))?;
        InventoryObject::from_reference(folder, Some("vm".to_string())).into_folder()
    }

    fn networks_named(&self, datacenter: &Datacenter, name: &str) -> Result<Vec<Network>> {
        let networks = self
            .retrieve_in_container(datacenter.reference(), "Network", &["name"])?
            .into_iter()
            .filter(|o| o.prop("name").map(Node::text) == Some(name))
            .map(|o| Network::new(o.obj).with_name(name))
            .collect();
        Ok(networks)
    }

    fn platform_version(&self) -> Result<String> {
        Ok(self.content.version.clone())
    }

    fn find_vm_by_uuid(&self, uuid: &str) -> Result<Option<ManagedObjectReference>> {
        let params = format!("{}{}", element("uuid", uuid), element("vmSearch", "true"));
        let found = self
            .invoke(&call("FindByUuid", &self.content.search_index, &params))?
            .child("returnval")
            .and_then(Node::to_reference);
        Ok(found)
    }

    fn virtual_machine_uuids(&self) -> Result<Vec<(ManagedObjectReference, Option<String>)>> {
        let vms = self
            .retrieve_in_container(&self.content.root_folder, "VirtualMachine", &["config.uuid"])?
            .into_iter()
            .map(|o| {
                let uuid = o.prop("config.uuid").map(|n| n.text().to_string());
                (o.obj, uuid)
            })
            .collect();
        Ok(vms)
    }
}

impl ManagementApi for VsphereClient {
    fn create_import_spec(
        &self,
        descriptor: &str,
        pool: &ResourcePool,
        datastore: &Datastore,
        params: &ImportSpecParams<'_>,
    ) -> Result<ImportSpec> {
        let mut cisp = String::from("<locale></locale><deploymentOption></deploymentOption>");
        if let Some(name) = params.entity_name {
            cisp.push_str(&element("entityName", name));
        }
        for mapping in params.network_mapping.iter() {
            cisp.push_str(&format!(
                "<networkMapping>{}{}</networkMapping>",
                element("name", &mapping.name),
                reference("network", mapping.network.reference())
            ));
        }
        let body = format!(
            "{}{}{}<cisp>{}</cisp>",
            element("ovfDescriptor", descriptor),
            reference("resourcePool", pool.reference()),
            reference("datastore", datastore.reference()),
            cisp
        );

        let response = self.invoke(&call("CreateImportSpec", &self.content.ovf_manager, &body))?;
        let result = response
            .child("returnval")
            .ok_or_else(|| Error::api("CreateImportSpec returned nothing"))?;

        let file_items = result
            .children_named("fileItem")
            .map(|item| FileItem {
                device_id: item.child_text("deviceId").unwrap_or_default().to_string(),
                path: item.child_text("path").unwrap_or_default().to_string(),
                size: item.child_text("size").and_then(|s| s.parse().ok()),
                create: item.child_text("create").map(parse_bool).unwrap_or(false),
            })
            .collect();

        Ok(ImportSpec {
            handle: result
                .child("importSpec")
                .map(|spec| spec.to_xml("spec"))
                .unwrap_or_default(),
            file_items,
            errors: result.children_named("error").map(fault_message).collect(),
            warnings: result.children_named("warning").map(fault_message).collect(),
        })
    }

    fn import_vapp(
        &self,
        pool: &ResourcePool,
        spec: &ImportSpec,
        folder: &Folder,
    ) -> Result<ManagedObjectReference> {
        if spec.handle.is_empty() {
            return Err(Error::api("import spec has no platform spec"));
        }
        let params = format!("{}{}", spec.handle, reference("folder", folder.reference()));
        let lease = self
            .invoke(&call("ImportVApp", pool.reference(), &params))?
            .child("returnval")
            .and_then(Node::to_reference)
            .ok_or_else(|| Error::api("ImportVApp returned no lease"))?;
        debug!(lease = %lease, "ImportVApp");
        Ok(lease)
    }

    fn lease_status(&self, lease: &ManagedObjectReference) -> Result<LeaseStatus> {
        let object = self.retrieve_one(lease, &["state", "error", "info"])?;
        let state_name = object.prop("state").map(Node::text).unwrap_or_default();
        let state = LeaseState::from_name(state_name)
            .ok_or_else(|| Error::lease(format!("unknown lease state '{}'", state_name)))?;

        let info = match object.prop("info") {
            Some(info) => Some(LeaseInfo {
                entity: info.child("entity").and_then(Node::to_reference),
                device_urls: info
                    .children_named("deviceUrl")
                    .map(|device| {
                        Ok(DeviceUrl {
                            import_key: device.child_text("importKey").unwrap_or_default().to_string(),
                            url: self.device_url(device.child_text("url").unwrap_or_default())?,
                            ssl_thumbprint: device
                                .child_text("sslThumbprint")
                                .filter(|t| !t.is_empty())
                                .map(str::to_string),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            }),
            None => None,
        };

        Ok(LeaseStatus {
            state,
            error: object.prop("error").map(fault_message),
            info,
        })
    }

    fn lease_progress(&self, lease: &ManagedObjectReference, percent: u8) -> Result<()> {
        self.lease_call(
            "HttpNfcLeaseProgress",
            lease,
            &element("percent", &percent.to_string()),
        )
    }

    fn lease_complete(&self, lease: &ManagedObjectReference) -> Result<()> {
        self.lease_call("HttpNfcLeaseComplete", lease, "")
    }

    fn lease_abort(&self, lease: &ManagedObjectReference, reason: &str) -> Result<()> {
        let fault = format!(
            r#"<fault><fault xsi:type="SystemError">{}</fault>{}</fault>"#,
            element("reason", reason),
            element("localizedMessage", reason)
        );
        self.lease_call("HttpNfcLeaseAbort", lease, &fault)
    }

    fn upload(
        &self,
        url: &Url,
        create: bool,
        body: UploadBody,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        let method = if create { Method::PUT } else { Method::POST };
        let mut request = self
            .transfer
            .request(method, url.clone())
            .header(CONTENT_TYPE, UPLOAD_CONTENT_TYPE)
            .body(Body::sized(body.reader, body.content_length));
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie.as_str());
        }
        // The transfer client has no overall timeout; the deadline bounds
        // the whole exchange, response included.
        if let Some(remaining) = cancel.remaining() {
            request = request.timeout(remaining);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() && cancel.is_cancelled() {
                Error::Cancelled
            } else {
                Error::api(format!("transfer to {} failed: {}", url, e))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::api(format!("transfer to {} returned HTTP {}", url, status)));
        }
        Ok(())
    }

    fn mark_as_template(&self, vm: &VirtualMachine) -> Result<()> {
        self.invoke(&call("MarkAsTemplate", vm.reference(), ""))?;
        Ok(())
    }
}
