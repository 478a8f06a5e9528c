use kube::CustomResourceExt;

fn main() {
    println!("---");
    let mut crd = controller::Bundle::crd();
    if let Some(ref mut schema) = crd.spec.versions[0].schema {
        if let Some(ref mut api) = schema.open_api_v3_schema {
            if let Some(ref mut props) = api.properties {
                props.entry("spec".into()).and_modify(|spec| {
                    if let Some(ref mut props) = spec.properties {
                        props.entry("values".into()).and_modify(|values| {
                            values.x_kubernetes_preserve_unknown_fields = Some(true);
                            values.additional_properties = None;
                        });
                    }
                });
                props.entry("status".into()).and_modify(|status| {
                    if let Some(ref mut props) = status.properties {
                        props.entry("info".into()).and_modify(|info| {
                            info.x_kubernetes_preserve_unknown_fields = Some(true);
                            info.additional_properties = None;
                        });
                    }
                });
            }
        }
    }
    print!("{}", serde_yaml::to_string(&crd).unwrap());
}
