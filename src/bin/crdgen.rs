use datavolume_controller::crd::{
    CDIConfig, DataSource, DataVolume, ObjectTransfer, StorageProfile, VolumeCloneSource,
    VolumeImportSource, VolumeUploadSource,
};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        DataVolume::crd(),
        DataSource::crd(),
        CDIConfig::crd(),
        StorageProfile::crd(),
        VolumeImportSource::crd(),
        VolumeUploadSource::crd(),
        VolumeCloneSource::crd(),
        ObjectTransfer::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
